//! Local app detection.
//!
//! Scans the process table for the Kea Control Agent and BIND 9 `named`,
//! extracts each daemon's configuration path from its command line, and
//! parses the configuration into access points. Detection repeats on an
//! interval so restarts and reconfigurations are picked up without agent
//! restarts.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use sysinfo::{ProcessRefreshKind, RefreshKind, System};
use tokio_util::sync::CancellationToken;

use heron_transport::rpc::{AccessPointKind, AccessPointReport, AppReport, AppType};

/// How often the process table is re-scanned.
pub const DETECTION_INTERVAL: Duration = Duration::from_secs(30);

/// Default Kea Control Agent configuration path.
const DEFAULT_KEA_CA_CONFIG: &str = "/etc/kea/kea-ctrl-agent.conf";

/// Default named configuration path.
const DEFAULT_NAMED_CONFIG: &str = "/etc/bind/named.conf";

/// The current app inventory, shared between the detection loop, the RPC
/// service, and the metrics re-exporter.
#[derive(Debug, Default)]
pub struct AppMonitor {
    apps: RwLock<Vec<AppReport>>,
}

impl AppMonitor {
    pub fn new() -> Self {
        AppMonitor::default()
    }

    pub fn apps(&self) -> Vec<AppReport> {
        self.apps.read().unwrap().clone()
    }

    pub fn replace(&self, apps: Vec<AppReport>) {
        *self.apps.write().unwrap() = apps;
    }

    /// The control access point of the first app of `app_type`, if any.
    pub fn control_point(&self, app_type: AppType) -> Option<AccessPointReport> {
        self.apps
            .read()
            .unwrap()
            .iter()
            .find(|app| app.app_type == app_type)
            .and_then(|app| {
                app.access_points
                    .iter()
                    .find(|ap| ap.kind == AccessPointKind::Control)
                    .cloned()
            })
    }

    /// Scan the process table once and replace the inventory.
    pub fn detect_once(&self) {
        let refresh = RefreshKind::new()
            .with_processes(ProcessRefreshKind::new().with_cmd(sysinfo::UpdateKind::Always));
        let system = System::new_with_specifics(refresh);
        let apps = detect_apps(&system);
        tracing::debug!(count = apps.len(), "App detection complete");
        self.replace(apps);
    }

    /// Re-detect on an interval until cancelled.
    pub async fn run_detection_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(DETECTION_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.detect_once(),
            }
        }
    }
}

/// Walk the process table and detect known daemons.
fn detect_apps(system: &System) -> Vec<AppReport> {
    let mut apps = Vec::new();
    for process in system.processes().values() {
        let name = process.name().to_string_lossy().to_string();
        let cmdline: Vec<String> = process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();

        if name == "kea-ctrl-agent" {
            let config = config_path_from_cmdline(&cmdline)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_KEA_CA_CONFIG));
            if let Some(app) = detect_kea_app(&config) {
                apps.push(app);
            }
        } else if name == "named" {
            let config = config_path_from_cmdline(&cmdline)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_NAMED_CONFIG));
            if let Some(app) = detect_bind9_app(&config) {
                apps.push(app);
            }
        }
    }
    apps
}

/// The `-c <path>` argument of a daemon command line.
fn config_path_from_cmdline(cmdline: &[String]) -> Option<PathBuf> {
    let pos = cmdline.iter().position(|arg| arg == "-c")?;
    cmdline.get(pos + 1).map(PathBuf::from)
}

/// Build the Kea app from its Control Agent configuration file.
/// Returns `None` when the file is missing, unparseable, or has no port.
pub fn detect_kea_app(config_path: &Path) -> Option<AppReport> {
    let text = std::fs::read_to_string(config_path).ok()?;
    let config = heron_keacfg::KeaConfig::from_json(&text).ok()?;

    let port = config.http_port()?;
    let address = config.effective_http_host();

    Some(AppReport {
        app_type: AppType::Kea,
        access_points: vec![AccessPointReport {
            kind: AccessPointKind::Control,
            address,
            port,
            key: None,
            use_secure_protocol: config.use_secure_protocol(),
        }],
    })
}

/// Build the BIND 9 app from its named.conf.
/// Returns `None` when no controls statement can be found.
pub fn detect_bind9_app(config_path: &Path) -> Option<AppReport> {
    let text = std::fs::read_to_string(config_path).ok()?;
    let control = heron_bindcfg::parse_control_channel(&text).ok()?;

    let mut access_points = vec![AccessPointReport {
        kind: AccessPointKind::Control,
        address: control.address,
        port: control.port,
        key: control.key,
        use_secure_protocol: false,
    }];

    if let Some(stats) = heron_bindcfg::parse_statistics_channel(&text) {
        access_points.push(AccessPointReport {
            kind: AccessPointKind::Statistics,
            address: stats.address,
            port: stats.port,
            key: None,
            use_secure_protocol: false,
        });
    }

    Some(AppReport {
        app_type: AppType::Bind9,
        access_points,
    })
}
