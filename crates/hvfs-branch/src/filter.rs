//! Filter operator
//!
//! Config format: `rule:<regex>;output_filename:<path>;`. Without a rule
//! every line is kept; without an output the operator does nothing. Kept
//! lines are buffered and appended to the output on flush.

use crate::backend::relative_path;
use crate::error::{BranchError, BranchResult};
use crate::line::BranchLine;
use crate::operator::{Flow, OpContext, Operator, OperatorKind, Signal};

use hvfs_common::SiteId;
use regex::bytes::Regex;
use tracing::{debug, error};

/// Which lines the filter keeps
#[derive(Debug, Clone)]
pub enum AcceptMode {
    All,
    /// No output configured; lines pass untouched
    Ignore,
    Matched(Regex),
}

pub struct FilterOperator {
    mode: AcceptMode,
    output: Option<String>,
    buffer: Vec<u8>,
    chunk: usize,
}

impl FilterOperator {
    /// Parse `config` and allocate the first buffer chunk
    pub fn open(config: &str, chunk: usize) -> BranchResult<Self> {
        let mut rule = None;
        let mut output = None;
        for field in config.split(';').filter(|f| !f.trim().is_empty()) {
            match field.split_once(':') {
                Some(("rule", value)) => rule = Some(value),
                Some(("output_filename", value)) => {
                    relative_path(value)?;
                    output = Some(value.to_string());
                }
                _ => {
                    return Err(BranchError::InvalidConfig(format!(
                        "unexpected filter field {field:?}"
                    )));
                }
            }
        }

        let mode = match (&output, rule) {
            (None, _) => AcceptMode::Ignore,
            (Some(_), None) => AcceptMode::All,
            (Some(_), Some(rule)) => AcceptMode::Matched(Regex::new(rule)?),
        };
        let chunk = chunk.max(1);
        debug!("filter opened: {:?} -> {:?}", mode, output);
        Ok(Self {
            mode,
            output,
            buffer: Vec::with_capacity(chunk),
            chunk,
        })
    }

    #[must_use]
    pub const fn mode(&self) -> &AcceptMode {
        &self.mode
    }

    /// Allocated buffer size
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    fn keep(&mut self, data: &[u8]) {
        let needed = self.buffer.len() + data.len();
        if needed > self.buffer.capacity() {
            let steps = (needed - self.buffer.capacity()).div_ceil(self.chunk);
            let target = self.buffer.capacity() + steps * self.chunk;
            self.buffer.reserve_exact(target - self.buffer.len());
        }
        self.buffer.extend_from_slice(data);
    }
}

impl Operator for FilterOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Filter
    }

    fn input(
        &mut self,
        cx: &OpContext<'_>,
        line: &BranchLine,
        _site: SiteId,
        _ack: u64,
        signal: &mut Signal,
    ) -> BranchResult<Flow> {
        self.enter(cx, signal)?;
        let keep = match &self.mode {
            AcceptMode::Ignore => false,
            AcceptMode::All => true,
            AcceptMode::Matched(rule) => {
                if !rule.is_match(&line.data) {
                    *signal = Signal::Stop;
                    return Ok(Flow::Swallow);
                }
                true
            }
        };
        if keep {
            self.keep(&line.data);
        }
        Ok(Flow::Forward)
    }

    /// Append buffered lines to the output; capacity is kept
    fn flush(&mut self, cx: &OpContext<'_>) -> BranchResult<()> {
        let Some(output) = &self.output else {
            return Ok(());
        };
        if self.buffer.is_empty() {
            return Ok(());
        }
        if let Err(e) = cx.backend.append_output(output, &self.buffer) {
            error!("flushing filter buffer to {} failed: {}", output, e);
            return Err(e);
        }
        self.buffer.clear();
        Ok(())
    }

    fn close(&mut self) {
        if !self.buffer.is_empty() {
            debug!("filter closed with {} unflushed bytes", self.buffer.len());
        }
    }

    fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FsBackend;
    use bytes::Bytes;
    use std::fs;
    use tempfile::TempDir;

    fn push(filter: &mut FilterOperator, cx: &OpContext<'_>, data: &'static [u8]) -> Flow {
        let line = BranchLine::primary(1, Bytes::from_static(data));
        let mut signal = Signal::Continue;
        filter
            .input(cx, &line, SiteId::client(1), 0, &mut signal)
            .unwrap()
    }

    #[test]
    fn test_modes() {
        let all = FilterOperator::open("output_filename:/f/all;", 16).unwrap();
        assert!(matches!(all.mode(), AcceptMode::All));
        let ignore = FilterOperator::open("rule:abc;", 16).unwrap();
        assert!(matches!(ignore.mode(), AcceptMode::Ignore));
        let matched = FilterOperator::open("rule:^err;output_filename:/f/err;", 16).unwrap();
        assert!(matches!(matched.mode(), AcceptMode::Matched(_)));

        assert!(matches!(
            FilterOperator::open("rule:(;output_filename:x", 16),
            Err(BranchError::Regex(_))
        ));
        assert!(matches!(
            FilterOperator::open("colour:blue", 16),
            Err(BranchError::InvalidConfig(_))
        ));
        assert!(matches!(
            FilterOperator::open("rule:x;output_filename:../outside.log;", 16),
            Err(BranchError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_matched_lines_flushed() {
        let dir = TempDir::new().unwrap();
        let backend = FsBackend::new(dir.path());
        let cx = OpContext {
            branch: "b",
            backend: &backend,
        };
        let mut filter = FilterOperator::open("rule:^err;output_filename:/logs/err;", 64).unwrap();

        assert_eq!(push(&mut filter, &cx, b"err disk\n"), Flow::Forward);
        assert_eq!(push(&mut filter, &cx, b"ok fine\n"), Flow::Swallow);
        assert_eq!(push(&mut filter, &cx, b"err net\n"), Flow::Forward);
        assert_eq!(filter.buffered_bytes(), 17);

        filter.flush(&cx).unwrap();
        assert_eq!(filter.buffered_bytes(), 0);
        assert_eq!(filter.capacity(), 64);
        let written = fs::read(backend.output_path("/logs/err").unwrap()).unwrap();
        assert_eq!(written, b"err disk\nerr net\n");
    }

    #[test]
    fn test_buffer_grows_by_chunk() {
        let dir = TempDir::new().unwrap();
        let backend = FsBackend::new(dir.path());
        let cx = OpContext {
            branch: "b",
            backend: &backend,
        };
        let mut filter = FilterOperator::open("output_filename:all.log", 8).unwrap();
        assert_eq!(filter.capacity(), 8);
        push(&mut filter, &cx, b"0123456789");
        assert_eq!(filter.capacity(), 16);
        push(&mut filter, &cx, b"abcdefghijklmnop");
        assert_eq!(filter.capacity(), 32);
        assert_eq!(filter.buffered_bytes(), 26);
    }

    #[test]
    fn test_ignore_mode_buffers_nothing() {
        let dir = TempDir::new().unwrap();
        let backend = FsBackend::new(dir.path());
        let cx = OpContext {
            branch: "b",
            backend: &backend,
        };
        let mut filter = FilterOperator::open("", 8).unwrap();
        assert_eq!(push(&mut filter, &cx, b"anything"), Flow::Forward);
        assert_eq!(filter.buffered_bytes(), 0);
        filter.flush(&cx).unwrap();
    }

    #[test]
    fn test_rule_matches_raw_bytes() {
        let dir = TempDir::new().unwrap();
        let backend = FsBackend::new(dir.path());
        let cx = OpContext {
            branch: "b",
            backend: &backend,
        };
        let mut filter = FilterOperator::open("rule:tail$;output_filename:o", 8).unwrap();
        assert_eq!(push(&mut filter, &cx, b"\xff\x00 tail"), Flow::Forward);
    }
}
