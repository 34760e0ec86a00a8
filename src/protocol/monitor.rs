use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use event_listener::Event;

use super::Phase;

/// A read-only view on the phase of a running shuffle.
///
/// The machine running the shuffle is the only writer, any number of
/// observers can hold a clone of this handle and poll or await the phase.
/// Reads are best effort: an observer may miss intermediate phases.
#[derive(Clone)]
pub struct Monitor {
    phase: Arc<AtomicU8>,
    changed: Arc<Event>,
}

impl Monitor {
    pub(crate) fn new() -> Self {
        Self {
            phase: Arc::new(AtomicU8::new(Phase::Uninitiated as u8)),
            changed: Arc::new(Event::new()),
        }
    }

    /// The last phase published by the machine.
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire)).unwrap_or(Phase::Uninitiated)
    }

    pub(crate) fn set(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
        self.changed.notify(usize::MAX);
    }

    /// Wait until the machine reaches a phase at least as far as `phase`.
    pub async fn wait_for(&self, phase: Phase) -> Phase {
        loop {
            let listener = self.changed.listen();
            let current = self.phase();
            if current >= phase {
                return current;
            }
            listener.await;
        }
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_wait_for_sees_later_phase() {
        let monitor = Monitor::new();
        assert_eq!(monitor.phase(), Phase::Uninitiated);

        let observer = monitor.clone();
        let handle =
            std::thread::spawn(move || smol::block_on(observer.wait_for(Phase::Shuffling)));
        monitor.set(Phase::Announcement);
        monitor.set(Phase::Completed);

        assert_eq!(handle.join().unwrap(), Phase::Completed);
    }
}
