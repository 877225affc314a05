//! Test bed for multi-core conference scenarios
//!
//! A [`TestBed`] owns one [`SimNetwork`] and the cores started on it. Each
//! core is wrapped in a [`CoreManager`] that dereferences to the core and adds
//! bounded waits, so scenarios read as a sequence of actions followed by the
//! counters or states they are expected to reach.
//!
//! ```no_run
//! use sipconf_tester::{call, TestBed};
//!
//! # async fn scenario() -> anyhow::Result<()> {
//! let bed = TestBed::new();
//! let marie = bed.manager("marie").await?;
//! let pauline = bed.manager("pauline").await?;
//! let call_id = call(&marie, &pauline).await?;
//! marie.terminate(&call_id)?;
//! bed.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use sipconf_core::{
    setup_logging, CallId, CallState, ConferenceInfo, ConferenceSession, Core, CoreConfig, CoreStats, LoggingConfig,
    ParticipantRole, SimNetwork, SipAddress,
};

/// Domain every test identity lives in
pub const DOMAIN: &str = "sip.example.org";

/// Upper bound of every wait in a scenario
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between two checks of a polled condition
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Address of a test user
pub fn address(user: &str) -> SipAddress {
    SipAddress::new(user, DOMAIN)
}

/// A running core and the name it was registered under
#[derive(Debug, Clone)]
pub struct CoreManager {
    name: String,
    core: Arc<Core>,
}

impl Deref for CoreManager {
    type Target = Core;

    fn deref(&self) -> &Core {
        &self.core
    }
}

impl CoreManager {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn stats(&self) -> CoreStats {
        self.core.stats_snapshot()
    }

    /// Wait until the counters of this core satisfy `predicate`
    pub async fn wait<F>(&self, what: &str, predicate: F) -> anyhow::Result<CoreStats>
    where
        F: FnMut(&CoreStats) -> bool,
    {
        self.core
            .stats()
            .wait_for(what, DEFAULT_TIMEOUT, predicate)
            .await
            .with_context(|| format!("{} waiting for {}", self.name, what))
    }

    /// Wait until `call_id` reaches `state` on this core
    pub async fn wait_call_state(&self, call_id: &CallId, state: CallState) -> anyhow::Result<()> {
        let what = format!("{} call {} in {:?}", self.name, call_id, state);
        wait_until(&what, DEFAULT_TIMEOUT, || self.call_state(call_id) == Some(state)).await
    }

    /// The conference the local user takes part in, if any
    pub fn joined_conference(&self) -> Option<ConferenceSession> {
        self.conferences().into_iter().find(|c| c.me().is_some())
    }

    /// Wait for a conference of this core matching `check` and return it
    pub async fn wait_conference<F>(&self, what: &str, mut check: F) -> anyhow::Result<ConferenceSession>
    where
        F: FnMut(&ConferenceSession) -> bool,
    {
        let mut found = None;
        wait_until(&format!("{} {}", self.name, what), DEFAULT_TIMEOUT, || {
            found = self.conferences().into_iter().find(|c| check(c));
            found.is_some()
        })
        .await?;
        found.ok_or_else(|| anyhow!("{} lost conference while waiting for {}", self.name, what))
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_until<F>(what: &str, timeout: Duration, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("timed out after {:?} waiting for {}", timeout, what);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Network and cores of one scenario
#[derive(Debug)]
pub struct TestBed {
    network: SimNetwork,
    managers: Mutex<Vec<CoreManager>>,
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBed {
    pub fn new() -> Self {
        if let Err(e) = setup_logging(LoggingConfig::for_tests()) {
            eprintln!("logging unavailable: {}", e);
        }
        Self {
            network: SimNetwork::new(),
            managers: Mutex::new(Vec::new()),
        }
    }

    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    /// Conference factory served by the focus of this bed
    pub fn factory_uri(&self) -> String {
        format!("sip:conference-factory@{}", DOMAIN)
    }

    pub fn factory_address(&self) -> SipAddress {
        address("conference-factory")
    }

    /// Default configuration of a user of this bed
    pub fn user_config(&self, user: &str) -> CoreConfig {
        CoreConfig::new(address(user).to_string())
    }

    /// Configuration of a user that creates conferences on `focus`
    pub fn remote_user_config(&self, user: &str, focus: &CoreManager) -> CoreConfig {
        self.user_config(user)
            .with_conference_factory(self.factory_uri())
            .with_ccmp_server(focus.identity().to_string())
            .with_auto_accept(true)
    }

    /// Start a user core with default settings
    pub async fn manager(&self, user: &str) -> anyhow::Result<CoreManager> {
        self.manager_with(user, self.user_config(user)).await
    }

    pub async fn manager_with(&self, name: &str, config: CoreConfig) -> anyhow::Result<CoreManager> {
        let core = Core::start(config, self.network.clone())
            .await
            .with_context(|| format!("starting core {}", name))?;
        info!(name, identity = %core.identity(), "test core started");
        let manager = CoreManager {
            name: name.to_string(),
            core,
        };
        self.managers.lock().await.push(manager.clone());
        Ok(manager)
    }

    /// Start a dedicated conference server serving [`Self::factory_uri`]
    pub async fn focus(&self, name: &str) -> anyhow::Result<CoreManager> {
        let config = CoreConfig::focus(address(name).to_string(), self.factory_uri());
        self.manager_with(name, config).await
    }

    /// Stop every core in reverse start order
    pub async fn shutdown(&self) {
        let mut managers = self.managers.lock().await;
        while let Some(manager) = managers.pop() {
            debug!(name = %manager.name, "stopping test core");
            manager.core.shutdown().await;
        }
    }
}

/// Place a call from `caller` to `callee` and wait until media flows on both
/// sides. Accepts the call on the callee unless it auto-accepts.
pub async fn call(caller: &CoreManager, callee: &CoreManager) -> anyhow::Result<CallId> {
    let call_id = caller.invite(callee.identity())?;
    wait_until(
        &format!("{} to receive the call of {}", callee.name, caller.name),
        DEFAULT_TIMEOUT,
        || callee.call_state(&call_id).is_some(),
    )
    .await?;

    if callee.call_state(&call_id) == Some(CallState::IncomingReceived) {
        callee.accept(&call_id)?;
    }
    caller.wait_call_state(&call_id, CallState::StreamsRunning).await?;
    callee.wait_call_state(&call_id, CallState::StreamsRunning).await?;
    Ok(call_id)
}

/// Scheduling record for a conference one hour from now
pub fn scheduled_info(organizer: &CoreManager, subject: &str, participants: &[&CoreManager]) -> ConferenceInfo {
    participants.iter().fold(
        ConferenceInfo::new(organizer.identity().clone())
            .with_subject(subject)
            .with_description("planning session")
            .with_start_time(Utc::now() + chrono::Duration::hours(1))
            .with_duration(60),
        |info, p| info.with_participant(p.identity().clone(), ParticipantRole::Speaker),
    )
}

/// Run a scenario and always stop the bed afterwards
pub async fn run_scenario<F, Fut>(scenario: F) -> anyhow::Result<()>
where
    F: FnOnce(Arc<TestBed>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let bed = Arc::new(TestBed::new());
    let result = scenario(bed.clone()).await;
    bed.shutdown().await;
    result
}
