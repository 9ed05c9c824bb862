//! Stream orchestrator: source → buffer pool → sink.

use crate::buffers::BufferPool;
use crate::sink::VideoSink;
use crate::source::{SourceKind, VideoSource};
use crate::PixelFormat;
use anyhow::{ensure, Context, Result};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Buffers allocated per negotiated format.
pub const POOL_SIZE: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// No format committed yet.
    Idle,
    /// Format committed, pool ready, waiting for STREAMON.
    Configured,
    /// Frames flowing.
    Streaming,
}

/// Owns the buffer pool and the video source, and drives the sink through
/// the stream lifecycle. Reconfiguration while streaming stops the stream
/// first; the host restarts it with a fresh STREAMON.
pub struct UvcStream {
    sink: Rc<RefCell<dyn VideoSink>>,
    source: Box<dyn VideoSource>,
    pool: Option<BufferPool>,
    state: StreamState,
    format: Option<PixelFormat>,
}

impl UvcStream {
    pub fn new(sink: Rc<RefCell<dyn VideoSink>>, source: Box<dyn VideoSource>) -> Self {
        Self {
            sink,
            source,
            pool: None,
            state: StreamState::Idle,
            format: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn format(&self) -> Option<&PixelFormat> {
        self.format.as_ref()
    }

    pub fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    /// Apply a committed format: push it to sink and source and rebuild the
    /// buffer pool. A source rejection or allocation failure leaves the
    /// stream configured (or idle before the first commit) without a pool,
    /// awaiting the next commit.
    pub fn apply_format(&mut self, format: PixelFormat) -> Result<()> {
        if self.state == StreamState::Streaming {
            warn!("format committed while streaming; stopping the stream first");
            self.stop_streaming()?;
        }

        // The kernel refuses S_FMT while buffers are allocated.
        if self.pool.take().is_some() {
            self.sink.borrow_mut().release_buffers()?;
        }

        let adjusted = self.sink.borrow_mut().set_format(&format)?;
        self.source
            .set_format(&adjusted)
            .context("video source rejected the committed format")?;

        self.format = Some(adjusted);
        self.state = StreamState::Configured;
        self.pool = Some(
            self.sink
                .borrow_mut()
                .request_buffers(POOL_SIZE)
                .context("allocate stream buffers")?,
        );
        debug!(format = ?adjusted, "stream configured");
        Ok(())
    }

    pub fn set_frame_rate(&mut self, fps: u32) {
        trace!(fps, "frame rate");
        self.source.set_frame_rate(fps);
    }

    /// React to a STREAMON (`true`) or STREAMOFF (`false`) edge.
    pub fn enable(&mut self, enable: bool) -> Result<()> {
        if enable {
            ensure!(
                self.state == StreamState::Configured,
                "stream start refused in {:?} state",
                self.state
            );
            let pool = self
                .pool
                .as_mut()
                .context("no buffer pool; awaiting a new commit")?;

            self.source.stream_on();
            let mut sink = self.sink.borrow_mut();
            // Prime: the kernel only reports buffer completions once
            // buffers have been queued.
            while let Some(index) = pool.acquire_free() {
                sink.queue(index, 0)?;
                pool.mark_queued(index)?;
            }
            sink.stream_on()?;
            drop(sink);

            self.state = StreamState::Streaming;
            debug!("streaming");
            Ok(())
        } else {
            if self.state != StreamState::Streaming {
                trace!("stream already stopped");
                return Ok(());
            }
            self.stop_streaming()
        }
    }

    /// Reactor callback for sink-readable: recycle one buffer.
    pub fn on_buffer_ready(&mut self) {
        if let Err(err) = self.pump_one() {
            warn!(error = ?err, "buffer cycle failed");
        }
    }

    fn pump_one(&mut self) -> Result<()> {
        if self.state != StreamState::Streaming {
            // Stale readiness from a watch removed this dispatch round.
            return Ok(());
        }
        let pool = self.pool.as_mut().context("streaming without a pool")?;
        let mut sink = self.sink.borrow_mut();

        let Some(index) = sink.dequeue()? else {
            return Ok(());
        };
        pool.mark_dequeued(index)?;

        if self.source.kind() == SourceKind::Active {
            // An autonomous source fills the buffer on its own schedule and
            // delivers it back through its completion path.
            self.source.queue(pool.memory_mut(index)?);
            return Ok(());
        }

        let bytesused = self.source.fill(pool.memory_mut(index)?) as u32;
        pool.mark_filled(index, bytesused)?;

        sink.queue(index, bytesused)?;
        pool.mark_queued(index)?;
        trace!(index, bytesused, "frame queued");
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<()> {
        let mut sink = self.sink.borrow_mut();
        sink.stream_off()?;
        if let Some(pool) = self.pool.as_mut() {
            // Collect whatever the kernel still reports, then reconcile:
            // STREAMOFF implicitly releases every queued buffer.
            while let Some(index) = sink.dequeue()? {
                pool.mark_dequeued(index)?;
            }
            let reclaimed = pool.reclaim_queued();
            if reclaimed > 0 {
                trace!(reclaimed, "buffers reclaimed after stream off");
            }
        }
        drop(sink);

        self.source.stream_off();
        self.state = StreamState::Configured;
        debug!("stream stopped");
        Ok(())
    }

    /// Orderly teardown: stop streaming, release the pool, free the source.
    pub fn shutdown(&mut self) {
        if self.state == StreamState::Streaming {
            if let Err(err) = self.stop_streaming() {
                warn!(error = ?err, "stream off during shutdown failed");
            }
        }
        if self.pool.take().is_some() {
            if let Err(err) = self.sink.borrow_mut().release_buffers() {
                warn!(error = ?err, "buffer release during shutdown failed");
            }
        }
        self.source.free_buffers();
        self.state = StreamState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::MockSink;
    use crate::source::TestPatternSource;
    use crate::FourCc;

    const WIDTH: u32 = 640;
    const HEIGHT: u32 = 360;
    const FRAME_BYTES: u32 = WIDTH * HEIGHT * 2;

    fn fixture() -> (Rc<RefCell<MockSink>>, UvcStream) {
        let sink = Rc::new(RefCell::new(MockSink::new(FRAME_BYTES as usize)));
        let stream = UvcStream::new(sink.clone(), Box::new(TestPatternSource::new()));
        (sink, stream)
    }

    fn yuyv() -> PixelFormat {
        PixelFormat {
            width: WIDTH,
            height: HEIGHT,
            fourcc: FourCc::new(b"YUYV"),
            sizeimage: FRAME_BYTES,
        }
    }

    fn queue_ops(sink: &Rc<RefCell<MockSink>>) -> Vec<String> {
        sink.borrow()
            .ops
            .iter()
            .filter(|op| op.starts_with("queue "))
            .cloned()
            .collect()
    }

    #[test]
    fn stream_start_refused_before_commit() {
        let (sink, mut stream) = fixture();
        assert!(stream.enable(true).is_err());
        assert_eq!(stream.state(), StreamState::Idle);
        assert!(!sink.borrow().ops.contains(&"stream_on".to_string()));
    }

    #[test]
    fn commit_builds_a_pool_of_four() {
        let (sink, mut stream) = fixture();
        stream.apply_format(yuyv()).unwrap();
        assert_eq!(stream.state(), StreamState::Configured);
        assert_eq!(stream.pool().unwrap().capacity(), 4);
        assert!(sink
            .borrow()
            .ops
            .contains(&"request_buffers 4".to_string()));
    }

    #[test]
    fn stream_on_primes_every_buffer_first() {
        let (sink, mut stream) = fixture();
        stream.apply_format(yuyv()).unwrap();
        stream.enable(true).unwrap();

        assert_eq!(stream.state(), StreamState::Streaming);
        let sink = sink.borrow();
        let ops = &sink.ops;
        let stream_on_at = ops.iter().position(|op| op == "stream_on").unwrap();
        let queued: Vec<_> = ops.iter().filter(|op| op.starts_with("queue ")).collect();
        assert_eq!(queued.len(), 4);
        assert!(ops
            .iter()
            .position(|op| op.starts_with("queue "))
            .unwrap()
            < stream_on_at);
        assert_eq!(stream.pool().unwrap().state_counts(), (0, 4, 0));
    }

    #[test]
    fn buffers_recycle_in_round_robin_order() {
        let (sink, mut stream) = fixture();
        stream.apply_format(yuyv()).unwrap();
        stream.enable(true).unwrap();
        sink.borrow_mut().ops.clear();

        for _ in 0..10 {
            stream.on_buffer_ready();
            let (free, queued, filled) = stream.pool().unwrap().state_counts();
            assert_eq!(free + queued + filled, 4);
        }

        let expected: Vec<String> = (0..10u32)
            .map(|cycle| format!("queue {} {FRAME_BYTES}", cycle % 4))
            .collect();
        assert_eq!(queue_ops(&sink), expected);
    }

    #[test]
    fn stream_off_returns_every_buffer() {
        let (sink, mut stream) = fixture();
        stream.apply_format(yuyv()).unwrap();
        stream.enable(true).unwrap();
        stream.enable(false).unwrap();

        assert_eq!(stream.state(), StreamState::Configured);
        assert!(sink.borrow().ops.contains(&"stream_off".to_string()));
        assert_eq!(stream.pool().unwrap().state_counts(), (4, 0, 0));
    }

    #[test]
    fn stream_off_when_not_streaming_is_a_no_op() {
        let (_sink, mut stream) = fixture();
        stream.apply_format(yuyv()).unwrap();
        stream.enable(false).unwrap();
        assert_eq!(stream.state(), StreamState::Configured);
    }

    #[test]
    fn commit_while_streaming_stops_the_stream_first() {
        let (sink, mut stream) = fixture();
        stream.apply_format(yuyv()).unwrap();
        stream.enable(true).unwrap();
        stream.apply_format(yuyv()).unwrap();

        let sink = sink.borrow();
        let ops = &sink.ops;
        let stop_at = ops.iter().position(|op| op == "stream_off").unwrap();
        let reformat_at = ops.iter().rposition(|op| op.starts_with("set_format")).unwrap();
        assert!(stop_at < reformat_at);
        assert_eq!(stream.state(), StreamState::Configured);
    }

    #[test]
    fn allocation_failure_leaves_configured_without_pool() {
        let (sink, mut stream) = fixture();
        sink.borrow_mut().fail_request_buffers = true;
        assert!(stream.apply_format(yuyv()).is_err());
        assert_eq!(stream.state(), StreamState::Configured);
        assert!(stream.pool().is_none());
        assert!(stream.enable(true).is_err());
    }

    #[test]
    fn source_rejection_aborts_the_commit() {
        let (_sink, mut stream) = fixture();
        let mjpeg = PixelFormat {
            fourcc: FourCc::new(b"MJPG"),
            ..yuyv()
        };
        assert!(stream.apply_format(mjpeg).is_err());
        // First-ever commit failed: still idle, nothing allocated.
        assert_eq!(stream.state(), StreamState::Idle);
        assert!(stream.pool().is_none());
    }

    #[test]
    fn shutdown_releases_everything() {
        let (sink, mut stream) = fixture();
        stream.apply_format(yuyv()).unwrap();
        stream.enable(true).unwrap();
        stream.shutdown();

        assert_eq!(stream.state(), StreamState::Idle);
        assert!(stream.pool().is_none());
        let sink = sink.borrow();
        assert!(sink.ops.contains(&"stream_off".to_string()));
        assert!(sink.ops.contains(&"release_buffers".to_string()));
    }
}
