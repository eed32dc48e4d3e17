use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, error, trace, warn};

use super::WorkerShared;
use crate::api::{SharedSocket, same_socket};
use crate::config::WorkerConfig;
use crate::errors::SocketError;
use crate::poller::{EventFlags, PollEvent, Poller};
use crate::types::{BlockingMode, DispatchResult, RawHandle, SocketState};

const CONNECTION_TIMED_OUT: &str = "Connection timed out (by worker)";

/// State owned by the event-loop thread alone.
pub(super) struct EventLoop {
    shared: Arc<WorkerShared>,
    poller: Arc<dyn Poller>,
    config: WorkerConfig,
    socket_map: HashMap<RawHandle, SharedSocket>,
    // Every candidate is also in `socket_map`.
    gc_candidates: HashMap<RawHandle, SharedSocket>,
    events: Vec<PollEvent>,
    last_gc: Instant,
}

impl EventLoop {
    pub(super) fn new(shared: Arc<WorkerShared>, poller: Arc<dyn Poller>, config: WorkerConfig) -> Self {
        Self {
            shared,
            poller,
            socket_map: HashMap::new(),
            gc_candidates: HashMap::new(),
            events: Vec::with_capacity(config.max_events),
            last_gc: Instant::now(),
            config,
        }
    }

    pub(super) fn run(mut self) {
        if let Err(err) = self.shared.connection_callback_queue.start() {
            error!(worker = %self.shared.name, %err, "Could not start the connection timeout queue");
        }
        self.last_gc = Instant::now();

        while !self.shared.stop.load(Ordering::Acquire) {
            self.iterate();
        }

        self.shutdown();
    }

    fn iterate(&mut self) {
        let count = match self.poller.wait(&mut self.events, self.config.wait_timeout) {
            Ok(count) => count,
            Err(err) => {
                error!(
                    worker = %self.shared.name,
                    epoll = self.poller.native_handle(),
                    %err,
                    "An error occurred while waiting for events"
                );
                self.events.clear();
                0
            }
        };

        self.callback_timed_out_connections();

        if count > 0 {
            // Sockets registered since the last pass may already have events.
            self.merge_socket_list();

            let events = std::mem::take(&mut self.events);
            for (index, event) in events.iter().enumerate() {
                trace!(
                    worker = %self.shared.name,
                    index,
                    count,
                    handle = event.handle,
                    events = ?event.flags,
                    "Epoll event"
                );
                self.handle_event(*event);
            }
            self.events = events;
        }

        self.dispatch_pending_sockets();

        if self.last_gc.elapsed() >= self.config.gc_interval {
            self.last_gc = Instant::now();
            self.garbage_collection();
        }

        self.merge_socket_list();
    }

    fn callback_timed_out_connections(&mut self) {
        let timed_out = std::mem::take(&mut *self.shared.connection_timed_out_queue.lock());
        if timed_out.is_empty() {
            return;
        }

        let socket_error = SocketError::timed_out(CONNECTION_TIMED_OUT);
        for socket in timed_out {
            // The real connect outcome may have won the race.
            if socket.state() == SocketState::Connecting {
                debug!(worker = %self.shared.name, handle = socket.native_handle(), "Connection timed out");
                socket.on_connected_event(Some(&socket_error));
            }
        }
    }

    fn handle_event(&mut self, event: PollEvent) {
        let Some(socket) = self.socket_map.get(&event.handle).cloned() else {
            // Unregistered and merged earlier in this batch.
            debug!(worker = %self.shared.name, handle = event.handle, "Event for an unknown socket is ignored");
            return;
        };

        if !socket.is_closable() {
            // Closed or failed just before this event was reported.
            debug!(
                worker = %self.shared.name,
                handle = event.handle,
                events = ?event.flags,
                "Events are ignored: socket is not closable"
            );
            return;
        }

        let mut flags = event.flags;

        // A socket added to epoll is reported writable right away
        // (OUT|HUP for plain sockets, OUT|IN for accepted clients).
        if socket.need_to_wait_first_event() {
            // Any first event ends the wait.
            socket.set_first_event_received();

            if flags.contains(EventFlags::WRITABLE) {
                flags.remove(EventFlags::WRITABLE);

                if !flags.contains(EventFlags::READABLE) {
                    debug!(
                        worker = %self.shared.name,
                        handle = event.handle,
                        events = ?event.flags,
                        "First event after registration is ignored"
                    );
                    return;
                }
            } else {
                debug!(
                    worker = %self.shared.name,
                    handle = event.handle,
                    events = ?event.flags,
                    "Writable event expected first"
                );
            }
        }

        let mut need_to_close = false;
        let mut new_state = SocketState::Closed;

        if flags.contains(EventFlags::WRITABLE) && socket.state() == SocketState::Connecting {
            match socket.socket_error() {
                Ok(0) => socket.on_connected_event(None),
                Ok(code) => {
                    need_to_close = true;
                    socket.on_connected_event(Some(&SocketError::from_os_code(code)));
                }
                Err(err) => {
                    need_to_close = true;
                    debug!(worker = %self.shared.name, handle = event.handle, %err, "Could not query socket error");
                    socket.on_connected_event(Some(&SocketError::new(
                        err.raw_os_error().unwrap_or_default(),
                        format!("Unknown error occurred: {flags:?}"),
                    )));
                }
            }
        }

        if socket.blocking_mode() == BlockingMode::Blocking {
            // Only the connect outcome is delivered in blocking mode.
            return;
        }

        if !need_to_close {
            if flags.contains(EventFlags::WRITABLE) {
                if !flags.contains(EventFlags::HANGUP) {
                    match socket.dispatch_events() {
                        DispatchResult::Dispatched => {}
                        DispatchResult::PartialDispatched => {
                            self.add_gc_candidate(&socket);
                        }
                        DispatchResult::Error => {
                            new_state = SocketState::Error;
                            need_to_close = true;
                        }
                    }
                } else {
                    trace!(worker = %self.shared.name, handle = event.handle, "Writable ignored by hangup");
                }
            }

            if flags.contains(EventFlags::READABLE) {
                socket.on_data_available_event();
            }

            if flags.contains(EventFlags::ERROR) {
                match socket.socket_error() {
                    Ok(code) => debug!(
                        worker = %self.shared.name,
                        handle = event.handle,
                        error = %SocketError::from_os_code(code),
                        "Error event detected"
                    ),
                    Err(err) => debug!(worker = %self.shared.name, handle = event.handle, %err, "Error event detected"),
                }
                new_state = SocketState::Error;
                need_to_close = true;
            }

            if flags.intersects(EventFlags::HANGUP | EventFlags::PEER_HALF_CLOSE)
                && socket.state() != SocketState::Error
            {
                socket.set_end_of_stream();
                new_state = SocketState::Disconnected;
                need_to_close = true;
            }
        }

        if need_to_close {
            self.remove_gc_candidate(&socket);

            if socket.is_closable() {
                socket.close_with_state(new_state);
            }

            if !self.shared.enqueue_to_dispatch_later(&socket) {
                socket.dispatch_events();
            }
        }
    }

    fn dispatch_pending_sockets(&mut self) {
        let sockets = self
            .shared
            .sockets_to_dispatch
            .lock()
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default();

        for socket in sockets {
            match socket.dispatch_events() {
                DispatchResult::Dispatched => {}
                DispatchResult::PartialDispatched => self.add_gc_candidate(&socket),
                DispatchResult::Error => {
                    socket.close_with_state(SocketState::Error);
                }
            }
        }
    }

    fn garbage_collection(&mut self) {
        let shared = self.shared.clone();
        self.gc_candidates.retain(|handle, socket| {
            if socket.has_expired_command() {
                warn!(
                    worker = %shared.name,
                    handle = *handle,
                    "Failed to send data for a long time; socket is garbage collected"
                );
                // Closing unregisters the handle. Unregistering again after
                // the descriptor is released could hit a newer socket.
                socket.close_internal();
                socket.dispatch_events();
                false
            } else if !socket.has_command() {
                debug!(worker = %shared.name, handle = *handle, "All commands of socket are processed");
                false
            } else {
                true
            }
        });
        self.publish_counts();
    }

    fn add_gc_candidate(&mut self, socket: &SharedSocket) {
        let handle = socket.native_handle();
        // Sockets still waiting in the insert queue are picked up on the next dispatch.
        let in_map = self
            .socket_map
            .get(&handle)
            .is_some_and(|live| same_socket(live, socket));
        if in_map {
            self.gc_candidates.insert(handle, socket.clone());
            self.publish_counts();
        }
    }

    fn remove_gc_candidate(&mut self, socket: &SharedSocket) {
        if let Entry::Occupied(entry) = self.gc_candidates.entry(socket.native_handle()) {
            if same_socket(entry.get(), socket) {
                entry.remove();
                self.publish_counts();
            }
        }
    }

    fn merge_socket_list(&mut self) {
        while let Some(socket) = self.shared.sockets_to_insert.pop() {
            let handle = socket.native_handle();
            trace!(worker = %self.shared.name, handle, "Socket is merged into the live map");
            self.socket_map.insert(handle, socket);
        }

        while let Some(socket) = self.shared.sockets_to_delete.pop() {
            let handle = socket.native_handle();
            // The handle may already belong to a newer socket.
            if let Entry::Occupied(entry) = self.socket_map.entry(handle) {
                if same_socket(entry.get(), &socket) {
                    entry.remove();
                    trace!(worker = %self.shared.name, handle, "Socket is removed from the live map");
                }
            }
            self.remove_gc_candidate(&socket);
        }

        self.publish_counts();
    }

    fn publish_counts(&self) {
        self.shared
            .socket_count
            .store(self.socket_map.len(), Ordering::Release);
        self.shared
            .gc_candidate_count
            .store(self.gc_candidates.len(), Ordering::Release);
    }

    fn shutdown(&mut self) {
        self.shared.connection_callback_queue.stop();
        self.merge_socket_list();

        for socket in self.socket_map.values() {
            // Close immediately, no half-close.
            if socket.is_closable() {
                socket.close_internal();
                socket.set_state(SocketState::Closed);
                socket.dispatch_events();
            }
        }

        // Sockets closed by other threads since the last pass have already
        // left the map; deliver their final events too. Later requests are
        // refused and handled by the caller.
        let pending = self.shared.sockets_to_dispatch.lock().take().unwrap_or_default();
        for socket in pending {
            socket.dispatch_events();
        }

        debug!(
            worker = %self.shared.name,
            sockets = self.socket_map.len(),
            "Event loop stopped"
        );
        self.socket_map.clear();
        self.gc_candidates.clear();
        self.publish_counts();
    }
}
