//! Client session state machine.
//!
//! One session per connection: exactly one `client_init` inside a bounded
//! bootstrap window, then an unbounded sequence of request cycles, then
//! teardown when the peer disconnects or a handler declares the
//! connection unusable.
//!
//! Failure policy, uniform across handlers: no bound service ends the
//! session; a data-integrity failure from the engine ends the session
//! after the error reply (the peer's data is presumed too corrupted to
//! continue); every other handler failure answers with the `error`
//! sentinel and keeps serving; a failed send always ends the session.

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use rmpv::Value;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::engine::{Context, PublishError};
use crate::protocol::{
    parse_command, ClientCommand, ClientInit, Response, METHOD_REQUEST_EXEC, METHOD_REQUEST_INIT,
    METHOD_REQUEST_SHUTDOWN,
};
use crate::service::{Service, ServiceRegistry};
use crate::wire::{Broker, RecvError, SendError};

/// Where the session is in its command sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, `client_init` not yet received.
    AwaitingInit,
    /// Bootstrapped, blocked on the next command.
    AwaitingCommand,
    /// A command handler is running.
    Dispatched,
    /// Terminal.
    Closed,
}

/// Handler outcome: keep serving or tear the connection down.
enum Flow {
    Continue,
    Stop,
}

pub struct Session {
    broker: Broker,
    registry: Arc<ServiceRegistry>,
    init_timeout: Duration,
    state: SessionState,
    service: Option<Arc<Service>>,
    /// The live per-request context, between request-begin and request-end.
    context: Option<Context>,
    /// Enablement last reported through a features reply.
    reported_enabled: Option<bool>,
}

impl Session {
    pub fn new(stream: UnixStream, registry: Arc<ServiceRegistry>, config: &RuntimeConfig) -> Self {
        Self {
            broker: Broker::new(stream, config),
            registry,
            init_timeout: config.init_recv_timeout,
            state: SessionState::AwaitingInit,
            service: None,
            context: None,
            reported_enabled: None,
        }
    }

    /// Serve the connection until it terminates. Consumes the session;
    /// the live context (if any) is torn down with it.
    pub fn run(mut self) {
        while self.state != SessionState::Closed {
            if let Flow::Stop = self.step() {
                self.state = SessionState::Closed;
            }
        }
        debug!("session closed");
    }

    fn step(&mut self) -> Flow {
        let bootstrapping = self.state == SessionState::AwaitingInit;
        let header_timeout = bootstrapping.then_some(self.init_timeout);

        let messages = match self.broker.recv(header_timeout) {
            Ok(messages) => messages,
            Err(RecvError::Disconnected) => {
                debug!("client disconnected");
                return Flow::Stop;
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "recoverable receive failure");
                // A peer that cannot even bootstrap cleanly is not worth
                // waiting on.
                let flow = if bootstrapping {
                    Flow::Stop
                } else {
                    Flow::Continue
                };
                return self.answer(Response::Error, flow);
            }
            Err(e) => {
                warn!(error = %e, "terminating session");
                return Flow::Stop;
            }
        };

        for message in messages {
            // Recomputed per message: a frame may carry the init and the
            // first command back to back.
            let awaiting_init = self.state == SessionState::AwaitingInit;
            self.state = SessionState::Dispatched;
            let flow = self.dispatch(message, awaiting_init);
            self.state = SessionState::AwaitingCommand;
            if let Flow::Stop = flow {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn dispatch(&mut self, message: Value, bootstrapping: bool) -> Flow {
        let command = match parse_command(message) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "unparseable command");
                let flow = if bootstrapping {
                    Flow::Stop
                } else {
                    Flow::Continue
                };
                return self.answer(Response::Error, flow);
            }
        };
        debug!(method = command.method(), "dispatching command");

        match (bootstrapping, command) {
            (true, ClientCommand::ClientInit(init)) => self.handle_client_init(*init),
            (true, other) => {
                warn!(method = other.method(), "command before client_init");
                self.answer(Response::Error, Flow::Stop)
            }
            (false, ClientCommand::ClientInit(_)) => {
                warn!("repeated client_init ignored");
                self.answer(Response::Error, Flow::Continue)
            }
            (false, ClientCommand::RequestInit { input }) => self.handle_request_init(input),
            (false, ClientCommand::RequestExec { scope, input }) => {
                self.handle_request_exec(scope, input)
            }
            (false, ClientCommand::ConfigSync { path }) => self.handle_config_sync(path),
            (false, ClientCommand::RequestShutdown {
                input,
                sampling_key,
            }) => self.handle_request_shutdown(input, sampling_key),
        }
    }

    fn handle_client_init(&mut self, init: ClientInit) -> Flow {
        info!(
            service = %init.identity.service,
            env = %init.identity.env,
            pid = init.pid,
            client_version = %init.client_version,
            runtime_version = %init.runtime_version,
            "client init"
        );

        let service = self.registry.get_or_create(
            &init.identity,
            &init.engine,
            &init.remote_config,
            init.enabled,
        );

        let ok = service.init_errors.is_empty();
        let mut meta = vec![("daemon.version".to_string(), crate::VERSION.to_string())];
        if let Some(version) = service.engine.generation().ruleset_version() {
            meta.push(("rules.version".to_string(), version.to_string()));
        }

        let response = Response::ClientInit {
            ok,
            errors: service.init_errors.clone(),
            meta,
            metrics: Vec::new(),
        };
        self.service = Some(service);
        self.answer(response, Flow::Continue)
    }

    fn handle_request_init(&mut self, input: Value) -> Flow {
        let Some(service) = self.service.clone() else {
            return self.missing_service();
        };
        if !service.enabled {
            self.reported_enabled = Some(false);
            return self.answer(Response::ConfigFeatures { enabled: false }, Flow::Continue);
        }

        if self.context.is_some() {
            warn!("request_init with a live context, replacing it");
            self.context = None;
        }

        let mut context = service.engine.context();
        match context.publish(input, None, false) {
            Ok(result) => {
                self.context = Some(context);
                self.answer(Response::verdict(METHOD_REQUEST_INIT, result), Flow::Continue)
            }
            Err(e) => self.data_integrity(e),
        }
    }

    fn handle_request_exec(&mut self, scope: Option<String>, input: Value) -> Flow {
        let Some(service) = self.service.clone() else {
            return self.missing_service();
        };
        if !service.enabled {
            self.reported_enabled = Some(false);
            return self.answer(Response::ConfigFeatures { enabled: false }, Flow::Continue);
        }

        // Interim evaluation may arrive before request-begin; give it a
        // context of its own in that case.
        let context = self
            .context
            .get_or_insert_with(|| service.engine.context());
        match context.publish(input, scope.as_deref(), true) {
            Ok(result) => self.answer(Response::verdict(METHOD_REQUEST_EXEC, result), Flow::Continue),
            Err(e) => self.data_integrity(e),
        }
    }

    fn handle_config_sync(&mut self, path: Option<String>) -> Flow {
        let Some(service) = self.service.clone() else {
            return self.missing_service();
        };
        if let Some(path) = path {
            debug!(path = %path, "config_sync heartbeat");
        }

        let enabled = service.enabled;
        if self.reported_enabled != Some(enabled) {
            self.reported_enabled = Some(enabled);
            self.answer(Response::ConfigFeatures { enabled }, Flow::Continue)
        } else {
            self.answer(Response::ConfigSyncAck, Flow::Continue)
        }
    }

    fn handle_request_shutdown(&mut self, input: Value, sampling_key: Option<String>) -> Flow {
        let Some(service) = self.service.clone() else {
            return self.missing_service();
        };

        // Teardown is guaranteed: the context leaves the session here and
        // drops on every exit path below.
        let mut context = match self.context.take() {
            Some(context) => context,
            None => service.engine.context(),
        };

        if !service.enabled {
            self.reported_enabled = Some(false);
            return self.answer(Response::ConfigFeatures { enabled: false }, Flow::Continue);
        }

        match context.publish(input, None, false) {
            Ok(result) => {
                let stats = context.stats();
                let mut response =
                    Response::verdict(METHOD_REQUEST_SHUTDOWN, result).with_stats(&stats);
                if let Some(key) = sampling_key {
                    response = response.with_meta("sampling.key", key);
                }
                self.answer(response, Flow::Continue)
            }
            Err(e) => self.data_integrity(e),
        }
    }

    fn missing_service(&mut self) -> Flow {
        warn!("command without a bound service");
        self.answer(Response::Error, Flow::Stop)
    }

    fn data_integrity(&mut self, e: PublishError) -> Flow {
        warn!(error = %e, "client data integrity failure, terminating session");
        self.context = None;
        self.answer(Response::Error, Flow::Stop)
    }

    fn answer(&mut self, response: Response, flow: Flow) -> Flow {
        match self.send(&response) {
            Ok(()) => flow,
            Err(e) => {
                warn!(error = %e, "send failed, terminating session");
                Flow::Stop
            }
        }
    }

    fn send(&mut self, response: &Response) -> Result<(), SendError> {
        let (name, payload) = response.to_message();
        self.broker.send(&[(name, &payload)])
    }
}
