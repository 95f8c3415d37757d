//! Windowed image streaming.
//!
//! The device holds at most `capacity` submitted images whose results have
//! not been fetched. The pipeline fills that window, then alternates one
//! retrieval with one submission so the window stays full, then drains it.

use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{LinkError, Result};
use crate::proto::message::{self, StreamProfile};
use crate::stats::Stats;
use crate::transport::Transport;

/// Host-side accounting for images on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionWindow {
    next_send_id: u32,
    next_recv_id: u32,
    capacity: u32,
}

impl SubmissionWindow {
    pub const FIRST_ID: u32 = 1;

    pub fn new(capacity: u32) -> Self {
        Self {
            next_send_id: Self::FIRST_ID,
            next_recv_id: Self::FIRST_ID,
            capacity,
        }
    }

    pub fn next_send_id(&self) -> u32 {
        self.next_send_id
    }

    pub fn next_recv_id(&self) -> u32 {
        self.next_recv_id
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn in_flight(&self) -> u32 {
        self.next_send_id.wrapping_sub(self.next_recv_id)
    }

    /// Capacity the device should report as still free.
    pub fn expected_remaining(&self) -> u32 {
        self.capacity - self.in_flight()
    }

    pub fn is_full(&self) -> bool {
        self.in_flight() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight() == 0
    }

    /// Records a submission and returns its id.
    pub fn push(&mut self) -> Result<u32> {
        if self.is_full() {
            return Err(LinkError::violation(format!(
                "submission with {} of {} images in flight",
                self.in_flight(),
                self.capacity
            )));
        }
        let id = self.next_send_id;
        self.next_send_id = self.next_send_id.wrapping_add(1);
        Ok(id)
    }

    /// Records retrieval of the oldest image and returns its id.
    pub fn pop(&mut self) -> Result<u32> {
        if self.is_empty() {
            return Err(LinkError::violation("retrieval with nothing in flight"));
        }
        let id = self.next_recv_id;
        self.next_recv_id = self.next_recv_id.wrapping_add(1);
        Ok(id)
    }

    fn unpush(&mut self) {
        self.next_send_id = self.next_send_id.wrapping_sub(1);
    }

    fn unpop(&mut self) {
        self.next_recv_id = self.next_recv_id.wrapping_sub(1);
    }
}

/// Outcome of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub id: u32,
    /// Window capacity the device reports as still free.
    pub remaining: u32,
}

/// A result fetched from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieved {
    pub id: u32,
    pub raw: Vec<u8>,
}

/// An active streaming mode bound to one device connection.
pub struct StreamPipeline<'d, T: Transport> {
    dev: &'d mut Dispatcher<T>,
    window: SubmissionWindow,
    mismatches: u32,
    fill_target: Option<u32>,
    pub stats: Stats,
}

impl<'d, T: Transport> StreamPipeline<'d, T> {
    /// Starts streaming and negotiates the window with the device.
    pub fn start(dev: &'d mut Dispatcher<T>, profile: &StreamProfile) -> Result<Self> {
        let rsp = dev.execute(&message::isi_start(profile))?;
        let capacity = message::isi_start_reply(&rsp);
        if capacity == 0 {
            error!("device advertised an empty window");
            return Err(LinkError::violation("stream started with zero window capacity"));
        }
        info!(
            capacity,
            width = profile.width,
            height = profile.height,
            format = profile.format,
            "stream started"
        );
        Ok(Self {
            dev,
            window: SubmissionWindow::new(capacity),
            mismatches: 0,
            fill_target: None,
            stats: Stats::new("stream"),
        })
    }

    pub fn configure(&mut self, model_id: u32, param: u32) -> Result<()> {
        self.dev.execute(&message::isi_config(model_id, param))?;
        Ok(())
    }

    /// Caps how many images `run` submits before its first retrieval.
    /// `None` fills the whole window.
    pub fn set_fill_target(&mut self, target: Option<u32>) {
        self.fill_target = target;
    }

    pub fn window(&self) -> &SubmissionWindow {
        &self.window
    }

    /// Sends one image under the next id.
    pub fn submit(&mut self, image: &[u8]) -> Result<Submitted> {
        let id = self.window.push()?;
        let rsp = match self.dev.execute_with_retry(&message::isi_send_image(id, image)) {
            Ok(rsp) => rsp,
            Err(e) => {
                self.window.unpush();
                return Err(e);
            }
        };
        let reported = message::isi_send_image_reply(&rsp);
        let remaining = self.check_remaining(reported)?;
        self.stats.add_submitted(image.len());
        debug!(id, remaining, in_flight = self.window.in_flight(), "submitted");
        Ok(Submitted { id, remaining })
    }

    /// Fetches the result of the oldest image in flight.
    pub fn retrieve(&mut self) -> Result<Retrieved> {
        let id = self.window.pop()?;
        match self.fetch(id) {
            Ok(raw) => {
                self.stats.add_retrieved(raw.len());
                debug!(id, len = raw.len(), in_flight = self.window.in_flight(), "retrieved");
                Ok(Retrieved { id, raw })
            }
            Err(e) => {
                self.window.unpop();
                Err(e)
            }
        }
    }

    fn fetch(&mut self, id: u32) -> Result<Vec<u8>> {
        let rsp = self.dev.execute(&message::isi_get_results(id))?;
        let len = message::isi_get_results_reply(&rsp);
        self.dev.read_bulk(len)
    }

    /// Compares the device's free-capacity report against local accounting.
    fn check_remaining(&mut self, reported: i32) -> Result<u32> {
        let capacity = self.window.capacity();
        let Ok(remaining) = u32::try_from(reported) else {
            error!(reported, "negative remaining capacity");
            return Err(LinkError::violation(format!(
                "device reported remaining capacity {reported}"
            )));
        };
        if remaining > capacity {
            error!(remaining, capacity, "remaining capacity above window");
            return Err(LinkError::violation(format!(
                "device reported remaining capacity {remaining} above window {capacity}"
            )));
        }
        let expected = self.window.expected_remaining();
        if remaining == expected {
            self.mismatches = 0;
            return Ok(remaining);
        }
        self.mismatches += 1;
        let limit = self.dev.config().window_mismatch_limit;
        warn!(
            remaining,
            expected,
            streak = self.mismatches,
            "window accounting disagrees with device"
        );
        if self.mismatches > limit {
            error!(remaining, expected, "window accounting desynchronised");
            return Err(LinkError::violation(format!(
                "window mismatch persisted for {} submissions (device {remaining}, host {expected})",
                self.mismatches
            )));
        }
        Ok(remaining)
    }

    /// Runs fill, steady state and drain over `images`, handing each result to
    /// `on_result` in id order. A result-local error from `on_result` counts
    /// as bad and the run continues.
    ///
    /// A stop request ends submissions; results already on the device are
    /// still retrieved unless the stop is forced.
    pub fn run<I, F>(&mut self, images: I, mut on_result: F) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
        F: FnMut(Retrieved) -> Result<()>,
    {
        let cancel = self.dev.cancel_token().clone();
        let mut images = images.into_iter().peekable();

        // fill
        let target = self.fill_target.unwrap_or(u32::MAX).max(1);
        let mut remaining = self.window.expected_remaining();
        while remaining > 0
            && !self.window.is_full()
            && self.window.in_flight() < target
            && !cancel.is_cancelled()
        {
            let Some(image) = images.next() else { break };
            remaining = self.submit(image.as_ref())?.remaining;
            self.stats.maybe_log();
        }

        // steady state
        while !cancel.is_cancelled() && images.peek().is_some() {
            if !self.window.is_empty() {
                let r = self.retrieve()?;
                self.stats.absorb(on_result(r))?;
            }
            if let Some(image) = images.next() {
                self.submit(image.as_ref())?;
            }
            self.stats.maybe_log();
        }

        // drain
        while !self.window.is_empty() {
            if cancel.is_forced() {
                warn!(in_flight = self.window.in_flight(), "drain abandoned");
                return Err(LinkError::Cancelled);
            }
            let r = self.retrieve()?;
            self.stats.absorb(on_result(r))?;
            self.stats.maybe_log();
        }

        if cancel.is_cancelled() {
            info!("stream stopped on request");
        }
        Ok(())
    }

    /// Ends streaming on the device and releases the window.
    pub fn stop(self) -> Result<()> {
        if !self.window.is_empty() {
            warn!(
                in_flight = self.window.in_flight(),
                "stopping with results still on the device"
            );
        }
        self.stats.log_summary();
        self.dev.end_mode()?;
        info!("stream stopped");
        Ok(())
    }
}
