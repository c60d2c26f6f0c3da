//! HVFS Proto - wire formats
//!
//! Envelopes exchanged between sites and the payloads carried inside them.
//! All integers are little-endian; every decoder checks lengths before
//! reading and reports short buffers as [`hvfs_common::Error::Corrupt`].

pub mod index;
pub mod kv;
pub mod message;
pub mod reply;
pub mod root;
pub mod storage;
mod wire;

pub use index::{IndexFlags, IndexRequest, ListOp, ListQuery};
pub use kv::{Column, ColumnSel, IndirectTable, KvOp, KvRecord, KvReply, KvRequest};
pub use message::{FRAME_HEADER_LEN, Frame, MAX_FRAME_LEN, OpCode, Reply, Request, TxFlags};
pub use reply::{
    BitmapPage, FieldKind, IndexDescriptor, LinkSource, MdReply, MdReplyBuilder, MetadataUnit,
    ReplyFlags,
};
pub use root::{RegisterReply, RingUpdate, RootTx, SiteAddr};
pub use storage::StorageIndex;
