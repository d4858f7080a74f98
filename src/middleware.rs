//! Connection middleware.
//!
//! Frames are owned records passed by value into middleware; a middleware
//! returns a new frame (or `None`, meaning "unchanged"). This avoids
//! mutation-at-a-distance — a middleware cannot hold a reference into a
//! frame it no longer controls.

use crate::wire::Frame;

/// The direction a frame is travelling when a middleware sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The frame is about to be written to the transport.
    Outgoing,
    /// The frame was just read from the transport, before dispatch.
    Incoming,
}

/// A single middleware stage. Applied exactly once per frame, in
/// registration order.
pub trait Middleware: Send + Sync + 'static {
    /// Transform `frame`. Returning `None` leaves it unchanged.
    fn apply(&self, direction: Direction, frame: Frame) -> Option<Frame>;
}

impl<F> Middleware for F
where
    F: Fn(Direction, Frame) -> Option<Frame> + Send + Sync + 'static,
{
    fn apply(&self, direction: Direction, frame: Frame) -> Option<Frame> {
        self(direction, frame)
    }
}

/// An ordered chain of middleware, run in registration order.
#[derive(Default)]
pub struct MiddlewareChain {
    stages: Vec<Box<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn push(&mut self, mw: impl Middleware) {
        self.stages.push(Box::new(mw));
    }

    /// Run every stage over `frame` in order, threading the (possibly
    /// replaced) frame through.
    pub fn run(&self, direction: Direction, mut frame: Frame) -> Frame {
        for stage in &self.stages {
            if let Some(replaced) = stage.apply(direction, frame.clone()) {
                frame = replaced;
            }
        }
        frame
    }
}
