use crate::config::BackendConfig;
use crate::error::LaunchError;
use crate::port::allocate_free_port;
use crate::version::{self, BackendVersion};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::{Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Per-probe timeout while waiting for a backend to come up
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A spawned backend and the port it was told to listen on
pub struct Launched {
    pub process: BackendProcess,
    pub port: u16,
}

/// Starts backend processes for log directories.
///
/// The registry only talks to launchers through this trait so it can be
/// exercised without a real backend installed.
pub trait Launch: Send + Sync + 'static {
    fn launch(
        &self,
        directory: &Path,
        reload_interval: u64,
        purge_orphaned_data: bool,
    ) -> impl Future<Output = Result<Launched, LaunchError>> + Send;
}

/// How a backend ended up after a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Process had already exited
    AlreadyExited,
    /// Process exited within the grace period
    Exited,
    /// Grace period exceeded, process was killed
    Killed,
    /// Grace period exceeded and kill was not requested
    Lingering,
}

/// Owned handle to a running backend process
pub struct BackendProcess {
    child: Child,
}

impl BackendProcess {
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, LaunchError> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            command: command.to_string(),
            source,
        })?;
        Ok(Self { child })
    }

    pub fn from_child(child: Child) -> Self {
        Self { child }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Check without waiting whether the process is gone
    pub fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the process to stop, escalating to a kill when `force` is set.
    pub async fn stop(mut self, name: &str, grace_period: Duration, force: bool) -> StopOutcome {
        if self.has_exited() {
            debug!(name, "Backend process already exited");
            return StopOutcome::AlreadyExited;
        }

        if let Some(pid) = self.child.id() {
            info!(name, pid, "Sending SIGTERM to backend");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = self.child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(name, ?status, "Backend process exited gracefully");
                StopOutcome::Exited
            }
            Ok(Err(e)) => {
                warn!(name, error = %e, "Error waiting for backend to exit");
                StopOutcome::Exited
            }
            Err(_) if force => {
                warn!(
                    name,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                if let Err(e) = self.child.kill().await {
                    warn!(name, error = %e, "Failed to kill backend process");
                }
                StopOutcome::Killed
            }
            Err(_) => {
                warn!(
                    name,
                    pid = self.child.id(),
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, leaving backend process running"
                );
                StopOutcome::Lingering
            }
        }
    }
}

/// Inputs to the backend command line
#[derive(Debug, Clone)]
pub struct LaunchArgs<'a> {
    pub directory: &'a Path,
    pub port: u16,
    pub reload_interval: u64,
    pub purge_orphaned_data: bool,
    pub bind_all: bool,
    pub version: &'a BackendVersion,
    /// Only used by backends older than the `serve` subcommand
    pub debugger_port: Option<u16>,
    pub extra_args: &'a [String],
}

/// Build the backend argument list for the installed version
pub fn build_args(args: &LaunchArgs<'_>) -> Vec<String> {
    let version = args.version;
    let mut argv = Vec::new();

    if version.uses_serve_subcommand() {
        argv.push("serve".to_string());
    }

    argv.extend([
        "--port".to_string(),
        args.port.to_string(),
        "--logdir".to_string(),
        args.directory.display().to_string(),
        "--reload_interval".to_string(),
        args.reload_interval.to_string(),
        "--purge_orphaned_data".to_string(),
        args.purge_orphaned_data.to_string(),
    ]);

    if args.bind_all {
        if version.supports_bind_all() {
            argv.push("--bind_all".to_string());
        } else {
            argv.extend(["--host".to_string(), "0.0.0.0".to_string()]);
        }
    }

    if version.supports_reload_multifile() {
        argv.extend(["--reload_multifile".to_string(), "true".to_string()]);
    }

    if version.supports_load_fast() {
        argv.extend(["--load_fast".to_string(), "false".to_string()]);
    }

    if !version.uses_serve_subcommand() {
        if let Some(port) = args.debugger_port {
            argv.extend(["--debugger_port".to_string(), port.to_string()]);
        }
    }

    argv.extend(args.extra_args.iter().cloned());
    argv
}

/// Launches real backend executables and waits for them to answer HTTP
pub struct Launcher {
    config: BackendConfig,
    /// Resolved once per process; `<command> --version` is slow
    version: OnceCell<BackendVersion>,
    probe_client: Client<HttpConnector, Empty<Bytes>>,
}

impl Launcher {
    pub fn new(config: BackendConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        // Probes must not keep idle connections open against new backends
        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self {
            config,
            version: OnceCell::new(),
            probe_client,
        }
    }

    async fn backend_version(&self) -> &BackendVersion {
        self.version
            .get_or_init(|| version::detect(&self.config.command, self.config.version.as_deref()))
            .await
    }

    /// GET the backend root once
    async fn probe(&self, port: u16) -> anyhow::Result<StatusCode> {
        let req = Request::builder()
            .method("GET")
            .uri(format!("http://127.0.0.1:{}/", port))
            .body(Empty::<Bytes>::new())?;

        let response = tokio::time::timeout(PROBE_TIMEOUT, self.probe_client.request(req))
            .await
            .map_err(|_| anyhow::anyhow!("probe timed out"))??;
        Ok(response.status())
    }

    /// Poll the backend root until it answers 2xx.
    ///
    /// Returns whether the backend became ready. Running out of attempts is
    /// not an error: slow backends often come up later.
    async fn wait_until_ready(&self, process: &mut BackendProcess, directory: &Path, port: u16) -> bool {
        let attempts = self.config.startup_attempts;
        let interval = self.config.startup_interval();

        for attempt in 1..=attempts {
            tokio::time::sleep(interval).await;

            if process.has_exited() {
                warn!(directory = %directory.display(), port, "Backend exited while starting");
                return false;
            }

            match self.probe(port).await {
                Ok(status) if status.is_success() => {
                    info!(
                        directory = %directory.display(),
                        port,
                        attempt,
                        %status,
                        "Backend is ready"
                    );
                    return true;
                }
                Ok(status) => {
                    debug!(port, attempt, %status, "Waiting for backend");
                }
                Err(e) => {
                    debug!(port, attempt, error = %e, "Waiting for backend");
                }
            }
        }

        warn!(
            directory = %directory.display(),
            port,
            attempts,
            "Backend did not become ready, registering it anyway"
        );
        false
    }
}

impl Launch for Launcher {
    async fn launch(
        &self,
        directory: &Path,
        reload_interval: u64,
        purge_orphaned_data: bool,
    ) -> Result<Launched, LaunchError> {
        let version = self.backend_version().await;

        let port = allocate_free_port().map_err(LaunchError::PortAllocation)?;
        let debugger_port = if version.uses_serve_subcommand() {
            None
        } else {
            Some(allocate_free_port().map_err(LaunchError::PortAllocation)?)
        };

        let argv = build_args(&LaunchArgs {
            directory,
            port,
            reload_interval,
            purge_orphaned_data,
            bind_all: self.config.effective_bind_all(),
            version,
            debugger_port,
            extra_args: &self.config.extra_args,
        });

        info!(
            command = %self.config.command,
            args = %argv.join(" "),
            %version,
            "Starting backend"
        );

        let mut process = BackendProcess::spawn(&self.config.command, &argv, &self.config.env)?;
        info!(directory = %directory.display(), port, pid = process.id(), "Backend process spawned");

        self.wait_until_ready(&mut process, directory, port).await;

        Ok(Launched { process, port })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn args_for<'a>(version: &'a BackendVersion, dir: &'a Path, bind_all: bool) -> LaunchArgs<'a> {
        LaunchArgs {
            directory: dir,
            port: 6100,
            reload_interval: 30,
            purge_orphaned_data: true,
            bind_all,
            version,
            debugger_port: Some(6200),
            extra_args: &[],
        }
    }

    #[test]
    fn test_build_args_modern_version() {
        let version = BackendVersion::parse("2.15.1").unwrap();
        let dir = PathBuf::from("/tmp/run1");
        let argv = build_args(&args_for(&version, &dir, true));

        assert_eq!(
            argv,
            vec![
                "serve",
                "--port",
                "6100",
                "--logdir",
                "/tmp/run1",
                "--reload_interval",
                "30",
                "--purge_orphaned_data",
                "true",
                "--bind_all",
                "--reload_multifile",
                "true",
                "--load_fast",
                "false",
            ]
        );
    }

    #[test]
    fn test_build_args_legacy_version() {
        let version = BackendVersion::parse("1.15.0").unwrap();
        let dir = PathBuf::from("/tmp/run1");
        let argv = build_args(&args_for(&version, &dir, true));

        assert_eq!(argv[0], "--port");
        assert!(argv.windows(2).any(|w| w == ["--host", "0.0.0.0"]));
        assert!(argv.windows(2).any(|w| w == ["--debugger_port", "6200"]));
        assert!(!argv.contains(&"--bind_all".to_string()));
        assert!(!argv.contains(&"--reload_multifile".to_string()));
        assert!(!argv.contains(&"serve".to_string()));
    }

    #[test]
    fn test_build_args_between_gates() {
        let version = BackendVersion::parse("2.3.0").unwrap();
        let dir = PathBuf::from("/data");
        let argv = build_args(&args_for(&version, &dir, true));

        assert!(argv.contains(&"--bind_all".to_string()));
        assert!(argv.windows(2).any(|w| w == ["--reload_multifile", "true"]));
        assert!(argv.windows(2).any(|w| w == ["--debugger_port", "6200"]));
        assert!(!argv.contains(&"serve".to_string()));
        assert!(!argv.contains(&"--load_fast".to_string()));
    }

    #[test]
    fn test_build_args_double_digit_minor() {
        // 2.10 must be treated as newer than 2.4
        let version = BackendVersion::parse("2.10.0").unwrap();
        let dir = PathBuf::from("/data");
        let argv = build_args(&args_for(&version, &dir, true));

        assert_eq!(argv[0], "serve");
        assert!(!argv.contains(&"--debugger_port".to_string()));
    }

    #[test]
    fn test_build_args_unknown_version_without_bind_all() {
        let version = BackendVersion::unknown();
        let dir = PathBuf::from("/data");
        let argv = build_args(&args_for(&version, &dir, false));

        assert!(!argv.contains(&"--host".to_string()));
        assert!(!argv.contains(&"--bind_all".to_string()));
        assert!(argv.windows(2).any(|w| w == ["--debugger_port", "6200"]));
    }

    #[test]
    fn test_build_args_appends_extra_args() {
        let version = BackendVersion::parse("2.15.0").unwrap();
        let dir = PathBuf::from("/data");
        let extra = vec!["--samples_per_plugin".to_string(), "images=0".to_string()];
        let mut args = args_for(&version, &dir, false);
        args.purge_orphaned_data = false;
        args.extra_args = &extra;
        let argv = build_args(&args);

        assert!(argv.windows(2).any(|w| w == ["--purge_orphaned_data", "false"]));
        assert_eq!(&argv[argv.len() - 2..], extra.as_slice());
    }

    #[tokio::test]
    async fn test_spawn_missing_executable_fails() {
        let result = BackendProcess::spawn("/nonexistent/backend-binary", &[], &HashMap::new());
        match result {
            Err(LaunchError::Spawn { command, .. }) => {
                assert_eq!(command, "/nonexistent/backend-binary");
            }
            _ => panic!("expected spawn error"),
        }
    }

    #[tokio::test]
    async fn test_launch_missing_executable_fails() {
        let mut config = BackendConfig::new("/nonexistent/backend-binary");
        config.version = Some("2.15.0".to_string());
        let launcher = Launcher::new(config);

        let result = launcher.launch(Path::new("/tmp/run1"), 30, true).await;
        assert!(matches!(result, Err(LaunchError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_launch_tolerates_backend_that_never_answers() {
        let mut config = BackendConfig::new("sleep");
        config.version = Some("2.15.0".to_string());
        config.startup_attempts = 2;
        config.startup_interval_ms = 20;
        let launcher = Launcher::new(config);

        // `sleep` rejects the generated flags and exits; launch still succeeds
        let launched = launcher
            .launch(Path::new("/tmp/run1"), 30, true)
            .await
            .unwrap();
        assert_ne!(launched.port, 0);
        let outcome = launched
            .process
            .stop("test", Duration::from_secs(1), true)
            .await;
        assert!(matches!(
            outcome,
            StopOutcome::AlreadyExited | StopOutcome::Exited
        ));
    }

    #[tokio::test]
    async fn test_stop_running_process() {
        let child = Command::new("sleep").arg("60").spawn().unwrap();
        let process = BackendProcess::from_child(child);

        let outcome = process.stop("test", Duration::from_secs(2), true).await;
        assert_eq!(outcome, StopOutcome::Exited);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_escalates_to_kill_when_forced() {
        let child = Command::new("sh")
            .args(["-c", "trap '' TERM; while true; do sleep 1; done"])
            .spawn()
            .unwrap();
        let process = BackendProcess::from_child(child);
        // Give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = process.stop("test", Duration::from_millis(300), true).await;
        assert_eq!(outcome, StopOutcome::Killed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_leaves_stubborn_process_without_force() {
        let child = Command::new("sh")
            .args(["-c", "trap '' TERM; while true; do sleep 1; done"])
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let process = BackendProcess::from_child(child);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = process.stop("test", Duration::from_millis(300), false).await;
        assert_eq!(outcome, StopOutcome::Lingering);

        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
    }
}
