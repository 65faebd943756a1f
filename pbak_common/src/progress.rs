// pbak_common is the main pbak library implementing the backup core logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::report::Progress;

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

/// A `ProgressHub` fans progress snapshots out to any number of
/// subscribers. Publishing never blocks: snapshots a subscriber
/// does not drain pile up in its channel, and snapshots published
/// before a subscription begins are not replayed.
#[derive(Debug, Default)]
pub struct ProgressHub {
    subscribers: Mutex<Vec<Sender<Progress>>>,
}

impl ProgressHub {
    /// Returns a new `ProgressHub` without any subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber and returns its [`Subscription`].
    /// Dropping the `Subscription` unsubscribes it; the hub prunes
    /// the dead channel on the next publication.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel();

        self.subscribers
            .lock()
            .expect("progress hub lock poisoned")
            .push(tx);

        Subscription { rx }
    }

    /// Publishes a snapshot to all live subscribers,
    /// dropping the ones that have gone away.
    pub fn publish(&self, progress: &Progress) {
        self.subscribers
            .lock()
            .expect("progress hub lock poisoned")
            .retain(|tx| tx.send(progress.clone()).is_ok());
    }

    /// Returns the number of live subscribers
    /// as of the last publication.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("progress hub lock poisoned")
            .len()
    }
}

/// A `Subscription` is the receiving end of a [`ProgressHub`]
/// registration. It unsubscribes when dropped.
#[derive(Debug)]
pub struct Subscription {
    rx: Receiver<Progress>,
}

impl Subscription {
    /// Blocks until the next snapshot arrives.
    /// Returns `None` once the publishing side has gone away.
    pub fn recv(&self) -> Option<Progress> {
        self.rx.recv().ok()
    }

    /// Blocks until the next snapshot arrives or the timeout elapses.
    /// Returns `None` on timeout or once the publishing side has gone away.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Progress> {
        match self.rx.recv_timeout(timeout) {
            Ok(progress) => Some(progress),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Returns the next snapshot if one is already queued.
    pub fn try_recv(&self) -> Option<Progress> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(step: &str) -> Progress {
        Progress {
            step: step.to_string(),
            step_num: 1,
            total_steps: 7,
            percentage: 10.0,
            current_file: None,
            speed_mbps: None,
        }
    }

    #[test]
    fn delivers_to_subscriber() {
        let hub = ProgressHub::new();
        let sub = hub.subscribe();

        hub.publish(&snapshot("one"));

        assert_eq!(sub.try_recv().unwrap().step, "one");
    }

    #[test]
    fn earlier_snapshots_are_not_replayed() {
        let hub = ProgressHub::new();
        hub.publish(&snapshot("missed"));

        let sub = hub.subscribe();
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let hub = ProgressHub::new();
        let sub = hub.subscribe();
        let _keep = hub.subscribe();
        drop(sub);

        hub.publish(&snapshot("prune"));

        assert_eq!(hub.subscriber_count(), 1);
    }
}
