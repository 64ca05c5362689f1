//! Security provider backed by an external helper command.
//!
//! The helper is run through `sh -c` once per initiation step. It receives its
//! inputs in the environment:
//!
//! | Variable                | Value                                           |
//! |-------------------------|-------------------------------------------------|
//! | `KERBPROXY_TARGET`      | canonical target, e.g. `HTTP/proxy.example.com` |
//! | `KERBPROXY_MECH`        | mechanism OID                                   |
//! | `KERBPROXY_MUTUAL`      | `1` if mutual authentication is requested       |
//! | `KERBPROXY_DELEGATE`    | `1` if credential delegation is requested       |
//! | `KERBPROXY_LIFETIME`    | requested lifetime in seconds, if any           |
//! | `KERBPROXY_INPUT_TOKEN` | base64 peer token, empty on the first step      |
//!
//! and prints the base64 output token on stdout. Exiting with status 3 asks for
//! credentials: the helper is run again with `KERBPROXY_PRINCIPAL` set and the
//! secret on stdin.
//!
//! A step that outlives the provider's timeout is killed. Tokens longer than
//! [`MAX_TOKEN_LEN`] bytes are rejected.

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use log::{debug, warn};
use secrecy::{ExposeSecret, SecretString};

use kerbproxy_common::{ConfigError, ProxyAuthConfig};

use crate::credentials::{
    CredentialRequest, CredentialSupplier, NoCredentials, StaticCredentialSupplier,
};
use crate::error::{ClientError, CredentialError, SecurityError};
use crate::mechanism::{
    CanonicalName, ContextLifetime, ContextRequest, HostBasedService, KRB5_OID, Mechanism,
    SPNEGO_OID, SecurityContext, SecurityProvider,
};
use crate::policy::DEFAULT_NEGOTIATION_TIMEOUT;

/// Exit status a helper uses to ask for credentials.
pub const NEEDS_CREDENTIALS: i32 = 3;

/// Largest decoded token accepted from a helper.
pub const MAX_TOKEN_LEN: usize = 64 * 1024;

// Base64 of MAX_TOKEN_LEN plus room for whitespace.
const MAX_STDOUT_LEN: usize = MAX_TOKEN_LEN / 3 * 4 + 1024;
const MAX_STDERR_LEN: usize = 4 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const COLLECT_GRACE: Duration = Duration::from_millis(200);

/// Runs an external command to produce negotiation tokens.
#[derive(Clone)]
pub struct HelperProvider {
    command: String,
    supplier: Arc<dyn CredentialSupplier>,
    timeout: Duration,
}

impl HelperProvider {
    /// Creates a provider for `command` that relies on cached tickets only.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            supplier: Arc::new(NoCredentials),
            timeout: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }

    /// Sets the supplier consulted when the helper asks for credentials.
    #[must_use]
    pub fn with_supplier(mut self, supplier: Arc<dyn CredentialSupplier>) -> Self {
        self.supplier = supplier;
        self
    }

    /// Sets how long one initiation step may run, credential round included,
    /// before the helper is killed.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builds a provider from `helper_command`, the configured credentials and
    /// the negotiation timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if no helper command is configured or the configured
    /// principal has no secret.
    pub fn from_config(config: &ProxyAuthConfig) -> Result<Self, ClientError> {
        let command = config
            .helper_command
            .clone()
            .ok_or_else(|| ConfigError::Invalid("helper_command is not set".to_string()))?;

        let provider = Self::new(command).with_timeout(config.negotiation_timeout());
        Ok(match config.resolve_credentials()? {
            Some(credentials) => {
                provider.with_supplier(Arc::new(StaticCredentialSupplier::new(credentials)))
            }
            None => provider,
        })
    }

    /// The helper command line.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Upper bound on one initiation step.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl fmt::Debug for HelperProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperProvider")
            .field("command", &self.command)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn is_supported(oid: &str) -> bool {
    oid == SPNEGO_OID || oid == KRB5_OID
}

impl SecurityProvider for HelperProvider {
    fn resolve_mechanism(&self, mechanism: &Mechanism) -> Result<Mechanism, SecurityError> {
        let inner_ok = mechanism
            .inner
            .as_ref()
            .is_none_or(|inner| inner.as_str() == KRB5_OID);
        if is_supported(mechanism.oid.as_str()) && inner_ok {
            Ok(mechanism.clone())
        } else {
            Err(SecurityError::UnsupportedMechanism(mechanism.to_string()))
        }
    }

    fn canonicalize_name(
        &self,
        name: &HostBasedService,
        _mechanism: &Mechanism,
    ) -> Result<CanonicalName, SecurityError> {
        let host = name.host().trim().trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() || name.service().is_empty() {
            return Err(SecurityError::InvalidName(name.to_string()));
        }
        Ok(CanonicalName::new(format!("{}/{host}", name.service())))
    }

    fn create_context(
        &self,
        target: &CanonicalName,
        mechanism: &Mechanism,
        request: ContextRequest,
    ) -> Result<Box<dyn SecurityContext>, SecurityError> {
        Ok(Box::new(HelperContext {
            command: self.command.clone(),
            target: target.clone(),
            mechanism: mechanism.oid.to_string(),
            request,
            supplier: Arc::clone(&self.supplier),
            timeout: self.timeout,
        }))
    }
}

struct HelperContext {
    command: String,
    target: CanonicalName,
    mechanism: String,
    request: ContextRequest,
    supplier: Arc<dyn CredentialSupplier>,
    timeout: Duration,
}

/// What a finished helper left behind.
struct HelperOutput {
    status: ExitStatus,
    stdout: Capture,
    stderr: Capture,
}

/// Leading bytes of a stream, and whether more followed.
#[derive(Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Drains `stream` on its own thread, keeping at most `limit` bytes so the
/// helper never blocks on a full pipe.
fn capture(stream: Option<impl Read + Send + 'static>, limit: usize) -> Receiver<Capture> {
    let (sender, receiver) = mpsc::channel();
    if let Some(mut stream) = stream {
        thread::spawn(move || {
            let mut captured = Capture::default();
            let mut chunk = [0_u8; 8192];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        let room = limit.saturating_sub(captured.bytes.len());
                        captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
                        captured.truncated |= n > room;
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
            let _ = sender.send(captured);
        });
    } else {
        let _ = sender.send(Capture::default());
    }
    receiver
}

/// Waits for `child` until `deadline`, killing it once the deadline passes.
fn wait_until(child: &mut Child, deadline: Instant) -> Result<ExitStatus, SecurityError> {
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| SecurityError::platform_with_source("helper did not finish", e))?
        {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            if let Err(e) = child.kill() {
                warn!("cannot kill helper: {e}");
            }
            let _ = child.wait();
            return Err(SecurityError::platform("helper timed out and was killed"));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Collects a stream drained by [`capture`], or `None` if something still
/// holds the pipe open after the deadline.
fn collect(receiver: &Receiver<Capture>, deadline: Instant) -> Option<Capture> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    receiver.recv_timeout(remaining.max(COLLECT_GRACE)).ok()
}

const fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

impl HelperContext {
    fn run(
        &self,
        input: &[u8],
        login: Option<(&str, &SecretString)>,
        deadline: Instant,
    ) -> Result<HelperOutput, SecurityError> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .env("KERBPROXY_TARGET", self.target.as_str())
            .env("KERBPROXY_MECH", &self.mechanism)
            .env("KERBPROXY_MUTUAL", flag(self.request.mutual_auth))
            .env("KERBPROXY_DELEGATE", flag(self.request.delegate_credentials))
            .env("KERBPROXY_INPUT_TOKEN", STANDARD.encode(input))
            .env_remove("KERBPROXY_PRINCIPAL")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let ContextLifetime::Seconds(seconds) = self.request.lifetime {
            command.env("KERBPROXY_LIFETIME", seconds.to_string());
        }
        if let Some((principal, _)) = login {
            command.env("KERBPROXY_PRINCIPAL", principal);
        }

        let mut child = command
            .spawn()
            .map_err(|e| SecurityError::platform_with_source("cannot run helper", e))?;

        let stdout = capture(child.stdout.take(), MAX_STDOUT_LEN);
        let stderr = capture(child.stderr.take(), MAX_STDERR_LEN);

        // Dropping stdin closes it, so a helper reading a secret sees EOF. A
        // helper that exits without reading leaves a broken pipe; its exit
        // status decides the outcome.
        if let Some(mut stdin) = child.stdin.take()
            && let Some((_, secret)) = login
        {
            match writeln!(stdin, "{}", secret.expose_secret()) {
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    debug!("helper closed stdin before reading the secret");
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SecurityError::platform_with_source("cannot pass secret", e));
                }
                Ok(()) => {}
            }
        }

        let status = wait_until(&mut child, deadline)?;
        let stdout = collect(&stdout, deadline)
            .ok_or_else(|| SecurityError::platform("helper output was not closed"))?;
        Ok(HelperOutput {
            status,
            stdout,
            stderr: collect(&stderr, deadline).unwrap_or_default(),
        })
    }

    fn credentials(&self) -> Result<(String, SecretString), CredentialError> {
        let mut requests = [
            CredentialRequest::name(format!("Principal for {}", self.target)),
            CredentialRequest::secret("Password"),
        ];
        self.supplier.supply(&mut requests)?;

        match requests {
            [
                CredentialRequest::Name {
                    value: Some(principal),
                    ..
                },
                CredentialRequest::Secret {
                    value: Some(secret),
                    ..
                },
            ] => Ok((principal, secret)),
            _ => Err(CredentialError::Missing(format!(
                "credentials for {}",
                self.target
            ))),
        }
    }
}

fn failure(output: &HelperOutput) -> SecurityError {
    let stderr = String::from_utf8_lossy(&output.stderr.bytes);
    let ellipsis = if output.stderr.truncated { "..." } else { "" };
    SecurityError::platform(format!(
        "helper failed ({}): {}{ellipsis}",
        output.status,
        stderr.trim()
    ))
}

fn decode_token(output: &HelperOutput) -> Result<Vec<u8>, SecurityError> {
    let too_long = || {
        SecurityError::platform(format!("helper token exceeds {MAX_TOKEN_LEN} bytes"))
    };
    if output.stdout.truncated {
        return Err(too_long());
    }

    let stdout = String::from_utf8_lossy(&output.stdout.bytes);
    let encoded = stdout.trim();
    if encoded.is_empty() {
        return Ok(Vec::new());
    }
    let token = STANDARD
        .decode(encoded)
        .or_else(|_| STANDARD_NO_PAD.decode(encoded))
        .map_err(|e| SecurityError::platform_with_source("helper printed an invalid token", e))?;
    if token.len() > MAX_TOKEN_LEN {
        return Err(too_long());
    }
    Ok(token)
}

impl SecurityContext for HelperContext {
    fn initiate_step(&mut self, input: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let deadline = Instant::now() + self.timeout;
        let output = self.run(input, None, deadline)?;
        if output.status.success() {
            return decode_token(&output);
        }
        if output.status.code() != Some(NEEDS_CREDENTIALS) {
            return Err(failure(&output));
        }

        debug!("helper needs credentials for {}", self.target);
        let (principal, secret) = self.credentials()?;
        let output = self.run(input, Some((&principal, &secret)), deadline)?;
        if output.status.success() {
            decode_token(&output)
        } else {
            Err(failure(&output))
        }
    }
}
