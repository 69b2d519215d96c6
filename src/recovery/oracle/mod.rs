//! Decryption by supervised execution.
//!
//! When a protector's method decryption cannot be reproduced statically, the protected
//! program is made to decrypt itself inside a helper process. The helper hooks JIT
//! compilation, loads the target, lets its module initializer populate the decryption state
//! and reports every method body it observed.
//!
//! An [`OracleSession`] owns one helper for one input file. The three requests are accepted in
//! exactly one order:
//!
//! 1. [`OracleSession::install_decrypt_hook`]
//! 2. [`OracleSession::load_target`]
//! 3. [`OracleSession::decrypt_methods`]
//!
//! Any fault (timeout, crash, garbage, out-of-order call) tears the helper down before the
//! error is returned; the session is then [`SessionState::Faulted`] and refuses further use.
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotreclaim::recovery::oracle::{
//!     decrypt_methods_out_of_process, OracleConfig, RuntimeVersion, TargetSource,
//! };
//!
//! let config = OracleConfig::default();
//! let cctor = [0x2A];
//! let methods = decrypt_methods_out_of_process(
//!     &config,
//!     RuntimeVersion::Clr40,
//!     TargetSource::Path("protected.exe".into()),
//!     &cctor,
//! )?;
//! println!("{} methods decrypted", methods.len());
//! # Ok::<(), dotreclaim::Error>(())
//! ```

pub mod channel;
pub mod protocol;

use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    metadata::{method::MethodBody, token::Token},
    recovery::methods::{DumpedMethod, DumpedMethods},
    Error, Result,
};

pub use channel::{OracleChannel, ProcessChannel};
pub use protocol::{Request, Response, TargetSource, WireMethod};

/// Runtime generation a helper has to host to load the target.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeVersion {
    /// CLR 2.0 (framework 2.0 to 3.5)
    Clr20,
    /// CLR 4.0 and later
    Clr40,
}

impl RuntimeVersion {
    /// Runtime for a metadata version string such as `v4.0.30319`.
    #[must_use]
    pub fn from_metadata_version(version: &str) -> Self {
        if version.starts_with("v1.") || version.starts_with("v2.") {
            RuntimeVersion::Clr20
        } else {
            RuntimeVersion::Clr40
        }
    }
}

/// Oracle settings.
#[derive(Debug, Clone)]
pub struct OracleConfig {
    /// Helper executable per runtime
    pub helpers: HashMap<RuntimeVersion, PathBuf>,

    /// Extra arguments passed to every helper.
    pub helper_args: Vec<String>,

    /// Time the helper has to report readiness (default: 30s).
    pub connect_timeout: Duration,

    /// Time the helper has to answer one request (default: 120s).
    pub request_timeout: Duration,

    /// Largest accepted frame in bytes.
    pub max_message_size: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        let helpers = HashMap::from([
            (
                RuntimeVersion::Clr20,
                PathBuf::from("dotreclaim-oracle-clr20"),
            ),
            (
                RuntimeVersion::Clr40,
                PathBuf::from("dotreclaim-oracle-clr40"),
            ),
        ]);

        Self {
            helpers,
            helper_args: Vec::new(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
            max_message_size: protocol::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl OracleConfig {
    /// Use `helper` for targets of `version`.
    #[must_use]
    pub fn with_helper(mut self, version: RuntimeVersion, helper: impl Into<PathBuf>) -> Self {
        self.helpers.insert(version, helper.into());
        self
    }

    /// Set both timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }

    /// Helper executable for `version`.
    #[must_use]
    pub fn helper_for(&self, version: RuntimeVersion) -> Option<&PathBuf> {
        self.helpers.get(&version)
    }
}

/// Lifecycle of an [`OracleSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    /// No helper
    Disconnected,
    /// Helper started, readiness not yet reported
    Connecting,
    /// Waiting for the next request
    Ready,
    /// A request is in flight
    Serving,
    /// Torn down after an error
    Faulted,
    /// Torn down normally
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    InstallHook,
    LoadTarget,
    DecryptMethods,
    Finished,
}

const STAGE_CONNECT: &str = "connect";
const STAGE_INSTALL_HOOK: &str = "install-decrypt-hook";
const STAGE_LOAD_TARGET: &str = "load-target";
const STAGE_DECRYPT_METHODS: &str = "decrypt-methods";

/// One helper, driven through the fixed request sequence.
#[derive(Debug)]
pub struct OracleSession<C: OracleChannel> {
    config: OracleConfig,
    channel: Option<C>,
    state: SessionState,
    next: Step,
    runtime: Option<RuntimeVersion>,
}

impl OracleSession<ProcessChannel> {
    /// Start the helper for `version` and wait until it is ready.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if no helper is configured for `version`,
    /// [`Error::FileError`] if it cannot be started, [`Error::OracleTimeout`] if it does not
    /// report in time and [`Error::OracleProtocol`] if it reports anything else or runs on
    /// the wrong runtime.
    pub fn connect(config: OracleConfig, version: RuntimeVersion) -> Result<Self> {
        let helper = config
            .helper_for(version)
            .ok_or_else(|| Error::NotFound(format!("oracle helper for runtime {version}")))?;
        let channel = ProcessChannel::spawn(helper, &config.helper_args, config.max_message_size)?;

        let mut session = OracleSession::with_channel(config, channel);
        let runtime = session.wait_connected()?;
        if runtime != version {
            return Err(session.fault(
                STAGE_CONNECT,
                Error::OracleProtocol {
                    stage: STAGE_CONNECT,
                    message: format!("Helper runs {runtime}, target needs {version}"),
                },
            ));
        }
        Ok(session)
    }
}

impl<C: OracleChannel> OracleSession<C> {
    /// Wrap an already started channel. The session is [`SessionState::Connecting`] until
    /// [`OracleSession::wait_connected`] succeeds.
    #[must_use]
    pub fn with_channel(config: OracleConfig, channel: C) -> Self {
        OracleSession {
            config,
            channel: Some(channel),
            state: SessionState::Connecting,
            next: Step::InstallHook,
            runtime: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runtime reported by the helper.
    #[must_use]
    pub fn runtime(&self) -> Option<RuntimeVersion> {
        self.runtime
    }

    /// Block until the helper reports readiness or the connect timeout elapses.
    ///
    /// # Errors
    /// Returns [`Error::OracleTimeout`] or [`Error::OracleProtocol`] with stage `connect`.
    pub fn wait_connected(&mut self) -> Result<RuntimeVersion> {
        if self.state != SessionState::Connecting {
            return Err(self.out_of_order(STAGE_CONNECT));
        }

        let timeout = self.config.connect_timeout;
        match self.receive(STAGE_CONNECT, timeout)? {
            Response::Ready { runtime } => {
                log::debug!("Oracle helper ready on {}", runtime);
                self.runtime = Some(runtime);
                self.state = SessionState::Ready;
                Ok(runtime)
            }
            other => Err(self.unexpected(STAGE_CONNECT, &other)),
        }
    }

    /// Ask the helper to hook JIT compilation with `module_cctor_bytes` as the bootstrap
    /// initializer.
    ///
    /// # Errors
    /// Returns [`Error::OracleProtocol`] or [`Error::OracleTimeout`] with stage
    /// `install-decrypt-hook`, including when called out of order.
    pub fn install_decrypt_hook(&mut self, module_cctor_bytes: &[u8]) -> Result<()> {
        let request = Request::InstallDecryptHook {
            module_cctor_bytes: module_cctor_bytes.to_vec(),
        };
        self.acknowledged(STAGE_INSTALL_HOOK, Step::InstallHook, &request)?;
        self.next = Step::LoadTarget;
        Ok(())
    }

    /// Ask the helper to load the target and run its module initializer.
    ///
    /// # Errors
    /// Returns [`Error::OracleProtocol`] or [`Error::OracleTimeout`] with stage
    /// `load-target`, including when called out of order.
    pub fn load_target(&mut self, target: TargetSource) -> Result<()> {
        self.acknowledged(STAGE_LOAD_TARGET, Step::LoadTarget, &Request::LoadTarget(target))?;
        self.next = Step::DecryptMethods;
        Ok(())
    }

    /// Collect every method body the helper observed.
    ///
    /// # Errors
    /// Returns [`Error::OracleProtocol`] or [`Error::OracleTimeout`] with stage
    /// `decrypt-methods`, including when called out of order or when a returned body is not a
    /// valid method body.
    pub fn decrypt_methods(&mut self) -> Result<DumpedMethods> {
        let response = self.exchange(
            STAGE_DECRYPT_METHODS,
            Step::DecryptMethods,
            &Request::DecryptMethods,
        )?;
        let wire_methods = match response {
            Response::DecryptedMethods(wire_methods) => wire_methods,
            other => return Err(self.unexpected(STAGE_DECRYPT_METHODS, &other)),
        };

        let mut methods = DumpedMethods::new();
        for method in wire_methods {
            match dumped_from_wire(method) {
                Ok(dumped) => {
                    methods.add(dumped);
                }
                Err(error) => return Err(self.fault(STAGE_DECRYPT_METHODS, error)),
            }
        }

        self.next = Step::Finished;
        log::info!("Oracle returned {} decrypted methods", methods.len());
        Ok(methods)
    }

    /// Ask the helper to exit and release it. Safe to call in any state.
    pub fn close(&mut self) {
        if let Some(channel) = self.channel.as_mut() {
            if self.state == SessionState::Ready {
                // The helper is killed right after, a lost goodbye does not matter
                let _ = channel.send(&Request::Shutdown);
            }
        }
        self.teardown();
        if self.state != SessionState::Faulted {
            self.state = SessionState::Closed;
        }
    }

    fn acknowledged(&mut self, stage: &'static str, step: Step, request: &Request) -> Result<()> {
        match self.exchange(stage, step, request)? {
            Response::Ack => Ok(()),
            other => Err(self.unexpected(stage, &other)),
        }
    }

    fn exchange(&mut self, stage: &'static str, step: Step, request: &Request) -> Result<Response> {
        if self.state != SessionState::Ready || self.next != step {
            return Err(self.out_of_order(stage));
        }

        self.state = SessionState::Serving;
        let sent = match self.channel.as_mut() {
            Some(channel) => channel.send(request),
            None => return Err(self.out_of_order(stage)),
        };
        if let Err(error) = sent {
            return Err(self.fault(stage, error));
        }

        let timeout = self.config.request_timeout;
        let response = self.receive(stage, timeout)?;
        if let Response::Error { message } = response {
            return Err(self.fault(
                stage,
                Error::OracleProtocol { stage, message },
            ));
        }

        self.state = SessionState::Ready;
        Ok(response)
    }

    fn receive(&mut self, stage: &'static str, timeout: Duration) -> Result<Response> {
        let received = match self.channel.as_mut() {
            Some(channel) => channel.receive(timeout),
            None => return Err(self.out_of_order(stage)),
        };
        received.map_err(|error| self.fault(stage, error))
    }

    fn out_of_order(&mut self, stage: &'static str) -> Error {
        let message = format!("Request not allowed in state {:?}/{:?}", self.state, self.next);
        self.fault(stage, Error::OracleProtocol { stage, message })
    }

    fn unexpected(&mut self, stage: &'static str, response: &Response) -> Error {
        let message = format!("Unexpected response {response:?}");
        self.fault(stage, Error::OracleProtocol { stage, message })
    }

    fn fault(&mut self, stage: &'static str, error: Error) -> Error {
        log::warn!("Oracle fault during '{}': {}", stage, error);
        self.teardown();
        self.state = SessionState::Faulted;

        match error {
            Error::OracleTimeout { .. } => Error::OracleTimeout { stage },
            Error::OracleProtocol { message, .. } => Error::OracleProtocol { stage, message },
            other => Error::OracleProtocol {
                stage,
                message: other.to_string(),
            },
        }
    }

    fn teardown(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.shutdown();
        }
    }
}

impl<C: OracleChannel> Drop for OracleSession<C> {
    fn drop(&mut self) {
        self.close();
    }
}

fn dumped_from_wire(method: WireMethod) -> Result<DumpedMethod> {
    let token = Token::new(method.token);
    if !token.is_method_def() {
        return Err(malformed_error!("{} is not a method token", token));
    }
    let body = MethodBody::parse(&method.body)?;
    Ok(DumpedMethod::from_body(token, method.rva, body))
}

/// Run a complete oracle session for one file: connect, hook, load, collect, close.
///
/// The helper is gone when this returns, whatever the outcome.
///
/// # Errors
/// See [`OracleSession::connect`] and the request methods.
pub fn decrypt_methods_out_of_process(
    config: &OracleConfig,
    version: RuntimeVersion,
    target: TargetSource,
    module_cctor_bytes: &[u8],
) -> Result<DumpedMethods> {
    let mut session = OracleSession::connect(config.clone(), version)?;
    session.install_decrypt_hook(module_cctor_bytes)?;
    session.load_target(target)?;
    let methods = session.decrypt_methods()?;
    session.close();
    Ok(methods)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
    };

    use super::*;

    #[derive(Default)]
    struct Script {
        sent: Mutex<Vec<Request>>,
        closed: AtomicBool,
    }

    struct ScriptedChannel {
        responses: VecDeque<Result<Response>>,
        script: Arc<Script>,
    }

    impl OracleChannel for ScriptedChannel {
        fn send(&mut self, request: &Request) -> Result<()> {
            self.script.sent.lock().unwrap().push(request.clone());
            Ok(())
        }

        fn receive(&mut self, _timeout: Duration) -> Result<Response> {
            self.responses
                .pop_front()
                .unwrap_or(Err(Error::OracleTimeout { stage: "receive" }))
        }

        fn shutdown(&mut self) {
            self.script.closed.store(true, Ordering::SeqCst);
        }
    }

    fn scripted(responses: Vec<Result<Response>>) -> (OracleSession<ScriptedChannel>, Arc<Script>) {
        let script = Arc::new(Script::default());
        let channel = ScriptedChannel {
            responses: responses.into(),
            script: Arc::clone(&script),
        };
        (
            OracleSession::with_channel(OracleConfig::default(), channel),
            script,
        )
    }

    fn ready() -> Result<Response> {
        Ok(Response::Ready {
            runtime: RuntimeVersion::Clr40,
        })
    }

    #[test]
    fn full_sequence() {
        let body = vec![(2 << 2) | 2, 0x17, 0x2A];
        let (mut session, script) = scripted(vec![
            ready(),
            Ok(Response::Ack),
            Ok(Response::Ack),
            Ok(Response::DecryptedMethods(vec![WireMethod {
                token: 0x0600_0002,
                rva: 0x2050,
                body,
            }])),
        ]);

        assert_eq!(session.wait_connected().unwrap(), RuntimeVersion::Clr40);
        assert_eq!(session.state(), SessionState::Ready);
        session.install_decrypt_hook(&[0x2A]).unwrap();
        session
            .load_target(TargetSource::Bytes(vec![0x4D, 0x5A]))
            .unwrap();
        let methods = session.decrypt_methods().unwrap();

        let method = methods.get(Token::method_def(2)).unwrap();
        assert_eq!(method.rva, 0x2050);
        assert_eq!(method.code, vec![0x17, 0x2A]);

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(script.closed.load(Ordering::SeqCst));

        let sent = script.sent.lock().unwrap();
        assert_eq!(sent.len(), 4);
        assert!(matches!(sent[0], Request::InstallDecryptHook { .. }));
        assert!(matches!(sent[1], Request::LoadTarget(_)));
        assert_eq!(sent[2], Request::DecryptMethods);
        assert_eq!(sent[3], Request::Shutdown);
    }

    #[test]
    fn skipping_the_hook_is_a_protocol_fault() {
        let (mut session, script) = scripted(vec![ready()]);
        session.wait_connected().unwrap();

        assert!(matches!(
            session.decrypt_methods(),
            Err(Error::OracleProtocol {
                stage: "decrypt-methods",
                ..
            })
        ));
        assert_eq!(session.state(), SessionState::Faulted);
        assert!(script.closed.load(Ordering::SeqCst));
        assert!(script.sent.lock().unwrap().is_empty());

        // A faulted session stays faulted
        assert!(session.install_decrypt_hook(&[0x2A]).is_err());
        session.close();
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn requests_before_ready_are_rejected() {
        let (mut session, script) = scripted(vec![ready()]);
        assert!(matches!(
            session.install_decrypt_hook(&[0x2A]),
            Err(Error::OracleProtocol {
                stage: "install-decrypt-hook",
                ..
            })
        ));
        assert!(script.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn timeout_is_reported_with_its_stage() {
        let (mut session, script) = scripted(vec![ready(), Ok(Response::Ack)]);
        session.wait_connected().unwrap();
        session.install_decrypt_hook(&[0x2A]).unwrap();

        assert!(matches!(
            session.load_target(TargetSource::Path("a.exe".into())),
            Err(Error::OracleTimeout {
                stage: "load-target"
            })
        ));
        assert_eq!(session.state(), SessionState::Faulted);
        assert!(script.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn helper_errors_and_garbage_fault_the_session() {
        let (mut session, _) = scripted(vec![
            ready(),
            Ok(Response::Error {
                message: "hook failed".to_string(),
            }),
        ]);
        session.wait_connected().unwrap();
        let error = session.install_decrypt_hook(&[0x2A]).unwrap_err();
        assert!(error.to_string().contains("hook failed"));

        let (mut session, _) = scripted(vec![
            ready(),
            Ok(Response::Ack),
            Ok(Response::Ack),
            Ok(Response::DecryptedMethods(vec![WireMethod {
                token: 0x0600_0001,
                rva: 0,
                body: vec![0x00],
            }])),
        ]);
        session.wait_connected().unwrap();
        session.install_decrypt_hook(&[]).unwrap();
        session.load_target(TargetSource::Bytes(Vec::new())).unwrap();
        assert!(matches!(
            session.decrypt_methods(),
            Err(Error::OracleProtocol {
                stage: "decrypt-methods",
                ..
            })
        ));
    }

    #[test]
    fn connect_expects_ready_first() {
        let (mut session, script) = scripted(vec![Ok(Response::Ack)]);
        assert!(session.wait_connected().is_err());
        assert_eq!(session.state(), SessionState::Faulted);
        assert!(script.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn dropping_a_session_releases_the_helper() {
        let (session, script) = scripted(vec![ready()]);
        drop(session);
        assert!(script.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn runtime_selection() {
        assert_eq!(
            RuntimeVersion::from_metadata_version("v2.0.50727"),
            RuntimeVersion::Clr20
        );
        assert_eq!(
            RuntimeVersion::from_metadata_version("v4.0.30319"),
            RuntimeVersion::Clr40
        );
        assert_eq!("CLR20".parse::<RuntimeVersion>().unwrap(), RuntimeVersion::Clr20);

        let config = OracleConfig::default().with_helper(RuntimeVersion::Clr20, "/opt/helper");
        assert_eq!(
            config.helper_for(RuntimeVersion::Clr20),
            Some(&PathBuf::from("/opt/helper"))
        );
    }

    #[test]
    fn missing_helper_config_is_not_found() {
        let mut config = OracleConfig::default();
        config.helpers.clear();
        assert!(matches!(
            OracleSession::connect(config, RuntimeVersion::Clr40),
            Err(Error::NotFound(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn connect_timeout_leaves_no_child() {
        let channel =
            ProcessChannel::spawn(std::path::Path::new("sleep"), &["30".to_string()], 1024)
                .unwrap();
        let pid = channel.id();
        let config = OracleConfig::default()
            .with_timeouts(Duration::from_millis(200), Duration::from_millis(200));
        let mut session = OracleSession::with_channel(config, channel);

        assert!(matches!(
            session.wait_connected(),
            Err(Error::OracleTimeout { stage: "connect" })
        ));
        assert_eq!(session.state(), SessionState::Faulted);
        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    }
}
