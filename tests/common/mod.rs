#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Each integration test binary uses a different subset of these fixtures"
)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use resilient_ws::error::Error;
use resilient_ws::ws::config::Config;
use resilient_ws::ws::{
    ConnectionManager, ExecutionContext, HandshakeResponse, Listener, ScheduledTask, Session,
    SessionEvents, Task, Transport,
};
use url::Url;

pub const ENDPOINT: &str = "ws://127.0.0.1:9001/stream";

/// Live-session bookkeeping shared by a [`MockTransport`] and its sessions.
#[derive(Debug, Default)]
pub struct Counters {
    live: AtomicUsize,
    max_live: AtomicUsize,
}

impl Counters {
    fn opened(&self) {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
    }

    fn released(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockSession {
    pub events: SessionEvents,
    counters: Arc<Counters>,
    released: AtomicBool,
    refuse_sends: Arc<AtomicBool>,
    pub sent_text: Mutex<Vec<String>>,
    pub sent_binary: Mutex<Vec<Bytes>>,
    pub close_calls: Mutex<Vec<(u16, String)>>,
    send_hook: Mutex<Option<SendHook>>,
}

type SendHook = Box<dyn FnOnce() + Send>;

impl MockSession {
    /// Runs `hook` inside the next send on this session, then refuses that frame.
    pub fn on_next_send<F: FnOnce() + Send + 'static>(&self, hook: F) {
        *self.send_hook.lock().unwrap() = Some(Box::new(hook));
    }

    fn run_send_hook(&self) -> bool {
        let hook = self.send_hook.lock().unwrap().take();
        match hook {
            Some(hook) => {
                hook();
                true
            }
            None => false,
        }
    }

    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            false
        } else {
            self.counters.released();
            true
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Session for MockSession {
    fn send_text(&self, text: String) -> bool {
        if self.run_send_hook() || self.is_released() || self.refuse_sends.load(Ordering::SeqCst) {
            return false;
        }
        self.sent_text.lock().unwrap().push(text);
        true
    }

    fn send_binary(&self, bytes: Bytes) -> bool {
        if self.run_send_hook() || self.is_released() || self.refuse_sends.load(Ordering::SeqCst) {
            return false;
        }
        self.sent_binary.lock().unwrap().push(bytes);
        true
    }

    fn close(&self, code: u16, reason: &str) -> bool {
        self.close_calls
            .lock()
            .unwrap()
            .push((code, reason.to_owned()));
        self.release()
    }
}

/// In-memory transport. Sessions never report events on their own; tests drive
/// them through [`MockTransport::session`].
#[derive(Default)]
pub struct MockTransport {
    sessions: Mutex<Vec<Arc<MockSession>>>,
    counters: Arc<Counters>,
    refuse_sends: Arc<AtomicBool>,
    cancel_all_calls: AtomicUsize,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of sessions ever opened.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// The `n`-th session opened, counting from zero.
    #[must_use]
    pub fn session(&self, n: usize) -> Arc<MockSession> {
        Arc::clone(&self.sessions.lock().unwrap()[n])
    }

    #[must_use]
    pub fn last_session(&self) -> Arc<MockSession> {
        Arc::clone(self.sessions.lock().unwrap().last().unwrap())
    }

    #[must_use]
    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn max_live(&self) -> usize {
        self.counters.max_live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn cancel_all_calls(&self) -> usize {
        self.cancel_all_calls.load(Ordering::SeqCst)
    }

    pub fn refuse_sends(&self, refuse: bool) {
        self.refuse_sends.store(refuse, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    fn open(&self, _endpoint: &Url, events: SessionEvents) -> Arc<dyn Session> {
        self.counters.opened();
        let session = Arc::new(MockSession {
            events,
            counters: Arc::clone(&self.counters),
            released: AtomicBool::new(false),
            refuse_sends: Arc::clone(&self.refuse_sends),
            sent_text: Mutex::default(),
            sent_binary: Mutex::default(),
            close_calls: Mutex::default(),
            send_hook: Mutex::default(),
        });
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        session
    }

    fn cancel_all(&self) {
        self.cancel_all_calls.fetch_add(1, Ordering::SeqCst);
        for session in self.sessions.lock().unwrap().iter() {
            session.release();
        }
    }
}

struct Timer {
    delay: Duration,
    handle: ScheduledTask,
    task: Task,
}

/// Execution context that only runs work when the test asks it to.
#[derive(Default)]
pub struct ManualContext {
    posted: Mutex<VecDeque<Task>>,
    timers: Mutex<VecDeque<Timer>>,
    delays: Mutex<Vec<Duration>>,
}

impl ManualContext {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs every posted task, including ones posted while running. Returns how many ran.
    pub fn run_posted(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.posted.lock().unwrap().pop_front();
            let Some(task) = next else {
                return ran;
            };
            task();
            ran += 1;
        }
    }

    #[must_use]
    pub fn posted_len(&self) -> usize {
        self.posted.lock().unwrap().len()
    }

    /// Fires the oldest timer. Returns `false` if there was none or it had been cancelled.
    pub fn fire_timer(&self) -> bool {
        let next = self.timers.lock().unwrap().pop_front();
        match next {
            Some(timer) if !timer.handle.is_cancelled() => {
                (timer.task)();
                true
            }
            _ => false,
        }
    }

    /// Timers scheduled and not cancelled.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.timers
            .lock()
            .unwrap()
            .iter()
            .filter(|timer| !timer.handle.is_cancelled())
            .count()
    }

    /// Every delay ever requested, in order.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

impl ExecutionContext for ManualContext {
    fn post(&self, task: Task) {
        self.posted.lock().unwrap().push_back(task);
    }

    fn post_delayed(&self, delay: Duration, task: Task) -> ScheduledTask {
        let handle = ScheduledTask::new();
        self.delays.lock().unwrap().push(delay);
        self.timers.lock().unwrap().push_back(Timer {
            delay,
            handle: handle.clone(),
            task,
        });
        handle
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open(u16),
    Text(String),
    Binary(Vec<u8>),
    Reconnecting,
    Closing(u16, String),
    Closed(u16, String),
    Failure(Option<u16>),
}

#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl Listener for RecordingListener {
    fn on_open(&self, response: &HandshakeResponse) {
        self.record(Event::Open(response.status));
    }

    fn on_text_message(&self, text: &str) {
        self.record(Event::Text(text.to_owned()));
    }

    fn on_binary_message(&self, bytes: &Bytes) {
        self.record(Event::Binary(bytes.to_vec()));
    }

    fn on_reconnecting(&self) {
        self.record(Event::Reconnecting);
    }

    fn on_closing(&self, code: u16, reason: &str) {
        self.record(Event::Closing(code, reason.to_owned()));
    }

    fn on_closed(&self, code: u16, reason: &str) {
        self.record(Event::Closed(code, reason.to_owned()));
    }

    fn on_failure(&self, _error: &Error, response: Option<&HandshakeResponse>) {
        self.record(Event::Failure(response.map(|response| response.status)));
    }
}

/// Knobs a state-machine test may flip on the manager's config.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub reconnect: bool,
    pub legacy_close_notification: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            reconnect: true,
            legacy_close_notification: false,
        }
    }
}

/// Everything a state-machine test needs, wired together.
pub struct Harness {
    pub manager: ConnectionManager,
    pub transport: Arc<MockTransport>,
    pub main: Arc<ManualContext>,
    pub background: Arc<ManualContext>,
    pub listener: Arc<RecordingListener>,
    pub online: Arc<AtomicBool>,
}

impl Harness {
    #[must_use]
    pub fn new() -> Self {
        Self::with(Options::default())
    }

    #[must_use]
    pub fn with(options: Options) -> Self {
        let transport = MockTransport::new();
        let main = ManualContext::new();
        let background = ManualContext::new();
        let listener = RecordingListener::new();
        let online = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&online);

        let config = Config::builder()
            .endpoint(ENDPOINT)
            .reconnect(options.reconnect)
            .legacy_close_notification(options.legacy_close_notification)
            .transport(Arc::clone(&transport) as Arc<dyn Transport>)
            .main_context(Arc::clone(&main) as Arc<dyn ExecutionContext>)
            .background_context(Arc::clone(&background) as Arc<dyn ExecutionContext>)
            .listener(Arc::clone(&listener) as Arc<dyn Listener>)
            .reachability(Arc::new(move || flag.load(Ordering::SeqCst)))
            .build();

        let manager = ConnectionManager::new(config).unwrap();

        Self {
            manager,
            transport,
            main,
            background,
            listener,
            online,
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Start and complete the handshake of the resulting session.
    pub fn connect(&self) -> Arc<MockSession> {
        self.manager.start();
        let session = self.transport.last_session();
        session.events.opened(HandshakeResponse::new(101));
        session
    }
}
