//! Per-invocation event loop.
//!
//! A current-thread tokio runtime pumps [`HardwareEvent`]s from an unbounded
//! channel into a single [`EventHandler`]. Backends post from any thread via
//! an [`EventDispatcher`]; the handler only ever runs on the pumping thread,
//! so events are processed one at a time in arrival order. The pump returns
//! only after [`LoopHandle::stop`] is called.

use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::Result;
use crate::traits::HardwareEvent;

/// Sending half of the loop, handed to hardware backends.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<HardwareEvent>,
}

impl EventDispatcher {
    /// Post an event to the loop.
    ///
    /// Returns `false` if the loop no longer exists.
    pub fn dispatch(&self, event: HardwareEvent) -> bool {
        trace!(?event, "dispatching hardware event");
        self.tx.send(event).is_ok()
    }
}

/// Handle used to stop the loop from inside a handler.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    token: CancellationToken,
}

impl LoopHandle {
    /// Stop the loop. The pump returns before delivering any further event.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Receiver of hardware events.
pub trait EventHandler {
    /// Process one event.
    fn handle(&mut self, event: HardwareEvent);
}

/// Single-threaded event loop owned by one recording invocation.
pub struct EventLoop {
    runtime: Runtime,
    tx: mpsc::UnboundedSender<HardwareEvent>,
    rx: mpsc::UnboundedReceiver<HardwareEvent>,
    token: CancellationToken,
}

impl EventLoop {
    /// Create a new loop bound to the calling thread.
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread().build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            runtime,
            tx,
            rx,
            token: CancellationToken::new(),
        })
    }

    /// A dispatcher posting into this loop.
    pub fn dispatcher(&self) -> EventDispatcher {
        EventDispatcher {
            tx: self.tx.clone(),
        }
    }

    /// A handle able to stop this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            token: self.token.clone(),
        }
    }

    /// Pump events into `handler` until the loop is stopped.
    ///
    /// Blocks the calling thread. There is no timeout: if the hardware never
    /// reports back, this never returns. The loop keeps a sender of its own,
    /// so the channel cannot close underneath it.
    pub fn run<H: EventHandler>(&mut self, handler: &mut H) {
        let Self {
            runtime, rx, token, ..
        } = self;

        debug!("event loop started");
        runtime.block_on(async {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    Some(event) = rx.recv() => handler.handle(event),
                }
            }
        });
        debug!(stopped = token.is_cancelled(), "event loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StopAfter {
        seen: Vec<HardwareEvent>,
        limit: usize,
        handle: LoopHandle,
    }

    impl EventHandler for StopAfter {
        fn handle(&mut self, event: HardwareEvent) {
            self.seen.push(event);
            if self.seen.len() == self.limit {
                self.handle.stop();
            }
        }
    }

    #[test]
    fn test_events_delivered_in_order_until_stopped() {
        let mut event_loop = EventLoop::new().expect("runtime should build");
        let dispatcher = event_loop.dispatcher();
        assert!(dispatcher.dispatch(HardwareEvent::DeviceOpened));
        assert!(dispatcher.dispatch(HardwareEvent::SessionConfigured));
        assert!(dispatcher.dispatch(HardwareEvent::DeviceDisconnected));

        let mut handler = StopAfter {
            seen: Vec::new(),
            limit: 2,
            handle: event_loop.handle(),
        };
        event_loop.run(&mut handler);

        assert_eq!(
            handler.seen,
            vec![HardwareEvent::DeviceOpened, HardwareEvent::SessionConfigured]
        );
        assert!(event_loop.handle().is_stopped());
    }

    #[test]
    fn test_events_from_other_threads_are_pumped() {
        let mut event_loop = EventLoop::new().expect("runtime should build");
        let dispatcher = event_loop.dispatcher();
        let worker = std::thread::spawn(move || {
            dispatcher.dispatch(HardwareEvent::RecorderInfo {
                what: 800,
                extra: 0,
            })
        });

        let mut handler = StopAfter {
            seen: Vec::new(),
            limit: 1,
            handle: event_loop.handle(),
        };
        event_loop.run(&mut handler);

        assert!(worker.join().expect("worker should not panic"));
        assert_eq!(handler.seen.len(), 1);
    }

    #[test]
    fn test_stopped_loop_returns_immediately() {
        let mut event_loop = EventLoop::new().expect("runtime should build");
        event_loop.handle().stop();
        event_loop.dispatcher().dispatch(HardwareEvent::DeviceOpened);

        let mut handler = StopAfter {
            seen: Vec::new(),
            limit: 1,
            handle: event_loop.handle(),
        };
        event_loop.run(&mut handler);
        assert!(handler.seen.is_empty());
    }

    #[test]
    fn test_loop_outlives_dropped_dispatchers() {
        let mut event_loop = EventLoop::new().expect("runtime should build");
        drop(event_loop.dispatcher());
        let handle = event_loop.handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            handle.stop();
        });

        let mut handler = StopAfter {
            seen: Vec::new(),
            limit: 1,
            handle: event_loop.handle(),
        };
        event_loop.run(&mut handler);

        stopper.join().expect("stopper should not panic");
        assert!(handler.seen.is_empty());
        assert!(event_loop.handle().is_stopped());
    }
}
