//! Token bucket service refilled by a single ticker
//!
//! Each registered controllable owns a context holding its configured
//! rates, its token reserves and the non-blocking requests still waiting for
//! tokens. A request walks the chain from its controllable up through the
//! registered ancestors, charging each one under that context's own lock;
//! the charges are remembered so a failed or reset request can give them
//! back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use super::config::{BandwidthConfig, BandwidthConfigure};
use super::{
    BandwidthContext, BandwidthControlService, BandwidthControllable, ControllableId,
    TokenBucket, TokenBucketCallback, AUDIO, DATA, OVERALL, VIDEO,
};

/// Bandwidth service backed by token buckets
pub struct SimpleBandwidthControlService {
    shared: Arc<Shared>,
}

struct Shared {
    config: BandwidthConfig,
    contexts: RwLock<HashMap<ControllableId, Arc<Context>>>,
}

struct Context {
    id: ControllableId,
    parent: Option<ControllableId>,
    controllable: Weak<dyn BandwidthControllable>,
    state: Mutex<ContextState>,
    cond: Condvar,
    /// Bumped on every reset so blocked requests of that channel give up
    epochs: [AtomicU64; 3],
}

struct ContextState {
    /// `None` when the controllable is unlimited
    config: Option<[i64; 4]>,
    tokens: [f64; 4],
    last_schedule: Option<Instant>,
    pending: [Vec<TokenRequest>; 3],
}

enum Take {
    Granted,
    Unlimited,
    Short,
}

impl ContextState {
    /// Reserve a channel draws from, `None` if it is unlimited
    fn slot(&self, channel: usize) -> Option<usize> {
        let config = self.config.as_ref()?;
        if config[OVERALL] >= 0 {
            Some(OVERALL)
        } else if config[channel] >= 0 {
            Some(channel)
        } else {
            None
        }
    }

    fn take(&mut self, channel: usize, tokens: f64) -> Take {
        match self.slot(channel) {
            None => Take::Unlimited,
            Some(slot) if self.tokens[slot] >= tokens => {
                self.tokens[slot] -= tokens;
                Take::Granted
            }
            Some(_) => Take::Short,
        }
    }

    /// Take whatever is there up to `*tokens`, shrinking `*tokens` to the grant
    fn take_up_to(&mut self, channel: usize, tokens: &mut f64) -> Take {
        let Some(slot) = self.slot(channel) else {
            return Take::Unlimited;
        };
        let granted = self.tokens[slot].min(*tokens).max(0.0);
        if granted <= 0.0 {
            return Take::Short;
        }
        self.tokens[slot] -= granted;
        *tokens = granted;
        Take::Granted
    }

    fn refund(&mut self, channel: usize, tokens: f64) {
        if let Some(slot) = self.slot(channel) {
            self.tokens[slot] += tokens;
        }
    }

    fn refill(&mut self, now: Instant, capacity: f64) {
        let Some(config) = self.config else {
            return;
        };
        let delta_ms = self
            .last_schedule
            .map(|last| now.saturating_duration_since(last).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        self.last_schedule = Some(now);

        if config[OVERALL] >= 0 {
            if capacity >= self.tokens[OVERALL] {
                self.tokens[OVERALL] += config[OVERALL] as f64 * delta_ms / 8000.0;
            }
        } else {
            for channel in [AUDIO, VIDEO, DATA] {
                if config[channel] >= 0 && capacity >= self.tokens[channel] {
                    self.tokens[channel] += config[channel] as f64 * delta_ms / 8000.0;
                }
            }
        }
    }
}

fn initial_tokens(configure: &BandwidthConfigure, capacity: u64) -> [f64; 4] {
    let mut tokens = [0.0; 4];
    for (i, slot) in tokens.iter_mut().enumerate() {
        let burst = configure.channel_initial_burst[i];
        *slot = if burst >= 0 {
            burst as f64
        } else {
            (capacity / 2) as f64
        };
    }
    tokens
}

enum RequestKind {
    Blocking {
        deadline: Option<Instant>,
        epoch: u64,
        origin: Arc<Context>,
    },
    Nonblocking(Arc<dyn TokenBucketCallback>),
    BestEffort,
}

struct TokenRequest {
    kind: RequestKind,
    initial: ControllableId,
    channel: usize,
    tokens: f64,
    /// Charges made so far, innermost first
    acquired: Vec<(ControllableId, f64)>,
}

enum Outcome {
    Granted(TokenRequest),
    Queued,
    Failed,
}

impl Shared {
    fn context(&self, id: ControllableId) -> Option<Arc<Context>> {
        self.contexts.read().get(&id).cloned()
    }

    /// Walk the chain from `start`, charging every limited context
    fn process(&self, mut request: TokenRequest, start: ControllableId) -> Outcome {
        let mut current = Some(start);
        let mut first = true;

        while let Some(id) = current {
            let Some(context) = self.context(id) else {
                if first {
                    self.rollback(&mut request, 0.0);
                    return Outcome::Failed;
                }
                // Unregistered ancestors do not limit anything
                break;
            };
            first = false;

            let mut state = context.state.lock();
            let channel = request.channel;
            let take = match &request.kind {
                RequestKind::Blocking {
                    deadline,
                    epoch,
                    origin,
                } => wait_for_tokens(
                    &context,
                    &mut state,
                    channel,
                    request.tokens,
                    *deadline,
                    || origin.epochs[channel].load(Ordering::Acquire) != *epoch,
                ),
                RequestKind::Nonblocking(_) => state.take(channel, request.tokens),
                RequestKind::BestEffort => state.take_up_to(channel, &mut request.tokens),
            };

            match take {
                Take::Granted => request.acquired.push((id, request.tokens)),
                Take::Unlimited => {}
                Take::Short => {
                    if matches!(request.kind, RequestKind::Nonblocking(_)) {
                        tracing::trace!(channel = channel, tokens = request.tokens, "Token request queued");
                        state.pending[channel].push(request);
                        return Outcome::Queued;
                    }
                    drop(state);
                    self.rollback(&mut request, 0.0);
                    return Outcome::Failed;
                }
            }
            drop(state);
            current = context.parent;
        }

        if matches!(request.kind, RequestKind::BestEffort) {
            let granted = request.tokens;
            self.rollback(&mut request, granted);
        }
        Outcome::Granted(request)
    }

    /// Give back every charge, keeping `keep` tokens of each
    fn rollback(&self, request: &mut TokenRequest, keep: f64) {
        while let Some((id, charged)) = request.acquired.pop() {
            if let Some(context) = self.context(id) {
                let refund = charged - keep;
                if refund > 0.0 {
                    context.state.lock().refund(request.channel, refund);
                }
            }
        }
    }

    /// Retry the queued requests of one context after a refill
    fn invoke_callbacks(self: &Arc<Self>, context: &Arc<Context>) {
        let pending: Vec<TokenRequest> = {
            let mut state = context.state.lock();
            state.pending.iter_mut().flat_map(std::mem::take).collect()
        };

        for request in pending {
            let Outcome::Granted(request) = self.process(request, context.id) else {
                continue;
            };
            if let RequestKind::Nonblocking(callback) = &request.kind {
                let bucket = Bucket::new(Arc::clone(self), request.initial, request.channel);
                callback.available(&bucket, request.tokens as u64);
            }
        }
    }

    /// Fail every request issued through one bucket
    fn reset_bucket(self: &Arc<Self>, initial: ControllableId, channel: usize) {
        let Some(origin) = self.context(initial) else {
            return;
        };
        origin.epochs[channel].fetch_add(1, Ordering::AcqRel);

        let mut removed = Vec::new();
        let mut current = Some(initial);
        while let Some(id) = current {
            let Some(context) = self.context(id) else {
                break;
            };
            {
                let mut state = context.state.lock();
                let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending[channel])
                    .into_iter()
                    .partition(|r| r.initial == initial);
                state.pending[channel] = rest;
                removed.extend(mine);
                context.cond.notify_all();
            }
            current = context.parent;
        }

        if removed.is_empty() {
            return;
        }
        let bucket = Bucket::new(Arc::clone(self), initial, channel);
        for mut request in removed {
            self.rollback(&mut request, 0.0);
            if let RequestKind::Nonblocking(callback) = &request.kind {
                callback.reset(&bucket, request.tokens as u64);
            }
        }
    }

    /// Fail whatever is still queued on a context that left the tree,
    /// including requests of descendants parked there
    fn drain_pending(self: &Arc<Self>, context: &Context) {
        let pending: Vec<TokenRequest> = {
            let mut state = context.state.lock();
            context.cond.notify_all();
            state.pending.iter_mut().flat_map(std::mem::take).collect()
        };
        for mut request in pending {
            self.rollback(&mut request, 0.0);
            if let RequestKind::Nonblocking(callback) = &request.kind {
                let bucket = Bucket::new(Arc::clone(self), request.initial, request.channel);
                callback.reset(&bucket, request.tokens as u64);
            }
        }
    }
}

/// Wait on the context's condvar until tokens are there, the deadline
/// passes or the origin bucket is reset
fn wait_for_tokens(
    context: &Context,
    state: &mut MutexGuard<'_, ContextState>,
    channel: usize,
    tokens: f64,
    deadline: Option<Instant>,
    was_reset: impl Fn() -> bool,
) -> Take {
    loop {
        match state.take(channel, tokens) {
            Take::Short => {}
            other => return other,
        }
        let expired = deadline.map(|d| Instant::now() >= d).unwrap_or(false);
        if expired || was_reset() {
            return Take::Short;
        }
        match deadline {
            Some(d) => {
                context.cond.wait_until(state, d);
            }
            None => context.cond.wait(state),
        }
    }
}

struct Bucket {
    shared: Arc<Shared>,
    controllable: ControllableId,
    channel: usize,
}

impl Bucket {
    fn new(shared: Arc<Shared>, controllable: ControllableId, channel: usize) -> Self {
        Self {
            shared,
            controllable,
            channel,
        }
    }

    fn request(&self, kind: RequestKind, tokens: f64) -> TokenRequest {
        TokenRequest {
            kind,
            initial: self.controllable,
            channel: self.channel,
            tokens,
            acquired: Vec::new(),
        }
    }
}

impl TokenBucket for Bucket {
    fn acquire_token(&self, tokens: u64, wait: Option<Duration>) -> bool {
        let Some(origin) = self.shared.context(self.controllable) else {
            return false;
        };
        let epoch = origin.epochs[self.channel].load(Ordering::Acquire);
        let deadline = wait.and_then(|w| Instant::now().checked_add(w));
        let request = self.request(
            RequestKind::Blocking {
                deadline,
                epoch,
                origin,
            },
            tokens as f64,
        );
        matches!(
            self.shared.process(request, self.controllable),
            Outcome::Granted(_)
        )
    }

    fn acquire_token_nonblocking(
        &self,
        tokens: u64,
        callback: Arc<dyn TokenBucketCallback>,
    ) -> bool {
        let request = self.request(RequestKind::Nonblocking(callback), tokens as f64);
        matches!(
            self.shared.process(request, self.controllable),
            Outcome::Granted(_)
        )
    }

    fn acquire_token_best_effort(&self, upper_limit: u64) -> u64 {
        let request = self.request(RequestKind::BestEffort, upper_limit as f64);
        match self.shared.process(request, self.controllable) {
            Outcome::Granted(request) => request.tokens as u64,
            _ => 0,
        }
    }

    fn capacity(&self) -> u64 {
        self.shared.config.default_capacity
    }

    fn speed(&self) -> f64 {
        let Some(context) = self.shared.context(self.controllable) else {
            return -1.0;
        };
        let state = context.state.lock();
        match state.config {
            Some(config) if config[OVERALL] >= 0 => config[OVERALL] as f64 / 8.0,
            Some(config) if config[self.channel] >= 0 => config[self.channel] as f64 / 8.0,
            _ => -1.0,
        }
    }

    fn reset(&self) {
        self.shared.reset_bucket(self.controllable, self.channel);
    }
}

impl SimpleBandwidthControlService {
    /// Create a service with default configuration
    pub fn new() -> Self {
        Self::with_config(BandwidthConfig::default())
    }

    /// Create a service with custom configuration
    pub fn with_config(config: BandwidthConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                contexts: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &BandwidthConfig {
        &self.shared.config
    }

    /// Number of registered controllables
    pub fn context_count(&self) -> usize {
        self.shared.contexts.read().len()
    }

    /// Snapshot of a context's reserves (audio, video, data, overall)
    pub fn tokens(&self, context: &BandwidthContext) -> Option<[f64; 4]> {
        self.shared
            .context(context.controllable())
            .map(|c| c.state.lock().tokens)
    }

    /// Number of non-blocking requests queued on a context
    pub fn pending_requests(&self, context: &BandwidthContext) -> usize {
        self.shared
            .context(context.controllable())
            .map(|c| c.state.lock().pending.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Run one refill tick now
    pub fn distribute_tokens(&self) {
        self.distribute_tokens_at(Instant::now());
    }

    /// Refill every context as of `now`, wake blocked waiters, then retry
    /// queued requests
    pub(crate) fn distribute_tokens_at(&self, now: Instant) {
        let contexts: Vec<Arc<Context>> = self.shared.contexts.read().values().cloned().collect();
        let capacity = self.shared.config.default_capacity as f64;

        for context in &contexts {
            let mut state = context.state.lock();
            state.refill(now, capacity);
            context.cond.notify_all();
        }
        for context in &contexts {
            self.shared.invoke_callbacks(context);
        }
    }

    /// Spawn the periodic refill task
    ///
    /// Returns a handle that can be used to abort the task.
    pub fn spawn_distributor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        let interval = service.shared.config.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let tick = Arc::clone(&service);
                if let Err(e) = tokio::task::spawn_blocking(move || tick.distribute_tokens()).await {
                    tracing::error!(error = %e, "Token distribution failed");
                }
            }
        })
    }

    #[cfg(test)]
    fn held_by_pending(&self) -> f64 {
        let contexts: Vec<Arc<Context>> = self.shared.contexts.read().values().cloned().collect();
        contexts
            .iter()
            .map(|c| {
                c.state
                    .lock()
                    .pending
                    .iter()
                    .flatten()
                    .flat_map(|r| r.acquired.iter().map(|(_, t)| *t))
                    .sum::<f64>()
            })
            .sum()
    }
}

impl Default for SimpleBandwidthControlService {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthControlService for SimpleBandwidthControlService {
    fn register(&self, controllable: &Arc<dyn BandwidthControllable>) -> BandwidthContext {
        let id = controllable.controllable_id();
        let configure = controllable.bandwidth_configure();
        let capacity = self.shared.config.default_capacity;

        let state = ContextState {
            config: configure.map(|c| c.channel_bandwidth),
            tokens: configure
                .map(|c| initial_tokens(&c, capacity))
                .unwrap_or([0.0; 4]),
            last_schedule: configure.map(|_| Instant::now()),
            pending: Default::default(),
        };
        let context = Arc::new(Context {
            id,
            parent: controllable.parent_controllable(),
            controllable: Arc::downgrade(controllable),
            state: Mutex::new(state),
            cond: Condvar::new(),
            epochs: Default::default(),
        });

        self.shared.contexts.write().insert(id, context);
        tracing::debug!(controllable = ?id, limited = configure.is_some(), "Bandwidth context registered");
        BandwidthContext::new(id)
    }

    fn unregister(&self, context: &BandwidthContext) {
        self.reset_buckets(context);
        let removed = self.shared.contexts.write().remove(&context.controllable());
        if let Some(removed) = removed {
            self.shared.drain_pending(&removed);
            tracing::debug!(controllable = ?context.controllable(), "Bandwidth context unregistered");
        }
    }

    fn lookup_context(&self, controllable: ControllableId) -> Option<BandwidthContext> {
        self.shared
            .context(controllable)
            .map(|_| BandwidthContext::new(controllable))
    }

    fn update_bw_configure(&self, context: &BandwidthContext) {
        let Some(ctx) = self.shared.context(context.controllable()) else {
            return;
        };
        let Some(controllable) = ctx.controllable.upgrade() else {
            return;
        };
        let configure = controllable.bandwidth_configure();
        let mut state = ctx.state.lock();

        let Some(configure) = configure else {
            state.config = None;
            state.last_schedule = None;
            return;
        };
        let new = configure.channel_bandwidth;
        match state.config.replace(new) {
            None => {
                state.last_schedule = Some(Instant::now());
                state.tokens = initial_tokens(&configure, self.shared.config.default_capacity);
            }
            Some(old) if new[OVERALL] >= 0 && old[OVERALL] < 0 => {
                let moved = state.tokens[AUDIO] + state.tokens[VIDEO] + state.tokens[DATA];
                state.tokens[OVERALL] += moved;
                for channel in [AUDIO, VIDEO, DATA] {
                    state.tokens[channel] = 0.0;
                }
                tracing::debug!(controllable = ?ctx.id, moved = moved, "Migrated channel reserves to overall");
            }
            Some(old) if new[OVERALL] < 0 && old[OVERALL] >= 0 => {
                if let Some(channel) = [AUDIO, VIDEO, DATA].into_iter().find(|&c| new[c] >= 0) {
                    let moved = state.tokens[OVERALL];
                    state.tokens[channel] += moved;
                    state.tokens[OVERALL] = 0.0;
                    tracing::debug!(controllable = ?ctx.id, channel = channel, moved = moved, "Migrated overall reserve to channel");
                }
            }
            Some(_) => {}
        }
    }

    fn reset_buckets(&self, context: &BandwidthContext) {
        for channel in [AUDIO, VIDEO, DATA] {
            self.shared.reset_bucket(context.controllable(), channel);
        }
    }

    fn audio_bucket(&self, context: &BandwidthContext) -> Arc<dyn TokenBucket> {
        Arc::new(Bucket::new(Arc::clone(&self.shared), context.controllable(), AUDIO))
    }

    fn video_bucket(&self, context: &BandwidthContext) -> Arc<dyn TokenBucket> {
        Arc::new(Bucket::new(Arc::clone(&self.shared), context.controllable(), VIDEO))
    }

    fn data_bucket(&self, context: &BandwidthContext) -> Arc<dyn TokenBucket> {
        Arc::new(Bucket::new(Arc::clone(&self.shared), context.controllable(), DATA))
    }
}
