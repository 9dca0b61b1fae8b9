//! Engine backed by the `kurtosis` command line client.

use super::{
    all_running, OrchestrationEngine, PortInfo, RunPackageRequest, RunPackageResult, ServiceInfo,
};
use crate::{binary::KurtosisBinary, wait::poll_until, Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const USER_SERVICES_SECTION: &str = "User Services";

/// Drives a local Kurtosis engine through its CLI
#[derive(Debug, Clone)]
pub struct KurtosisCli {
    binary: PathBuf,
    poll_interval: Duration,
}

impl KurtosisCli {
    pub fn new(binary: KurtosisBinary) -> Result<Self> {
        Ok(Self {
            binary: binary.resolve()?,
            poll_interval: Duration::from_secs(2),
        })
    }

    /// Interval between `enclave inspect` calls while waiting for services
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn binary(&self) -> &std::path::Path {
        &self.binary
    }

    async fn exec(&self, cancel: &CancellationToken, args: &[String]) -> Result<String> {
        tracing::debug!("Executing kurtosis {}", args.join(" "));

        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Engine(format!("Failed to spawn {}: {}", self.binary.display(), e))
            })?;

        // Dropping the child on cancellation kills it
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            output = child.wait_with_output() => output?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Engine(format!(
                "kurtosis {} exited with {}: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                detail
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl OrchestrationEngine for KurtosisCli {
    async fn run_package(
        &self,
        cancel: &CancellationToken,
        request: &RunPackageRequest,
    ) -> Result<RunPackageResult> {
        let mut args_file = tempfile::Builder::new()
            .prefix("ethereum-package-")
            .suffix(".yaml")
            .tempfile()?;
        args_file.write_all(request.config_yaml.as_bytes())?;
        args_file.flush()?;

        let mut args = vec![
            "run".to_string(),
            "--enclave".to_string(),
            request.enclave_name.clone(),
            "--args-file".to_string(),
            args_file.path().to_string_lossy().to_string(),
        ];
        if request.dry_run {
            args.push("--dry-run".to_string());
        }
        if request.parallelism > 0 {
            args.push("--parallelism".to_string());
            args.push(request.parallelism.to_string());
        }
        if request.verbose {
            args.push("--verbosity".to_string());
            args.push("detailed".to_string());
        }
        args.push(request.package_id.clone());

        let stdout = self.exec(cancel, &args).await?;
        let response_lines: Vec<String> = stdout.lines().map(str::to_string).collect();
        for line in &response_lines {
            tracing::trace!("kurtosis: {}", line);
        }

        Ok(RunPackageResult {
            enclave_name: request.enclave_name.clone(),
            response_lines,
        })
    }

    async fn get_services(
        &self,
        cancel: &CancellationToken,
        enclave_name: &str,
    ) -> Result<HashMap<String, ServiceInfo>> {
        let args = [
            "enclave".to_string(),
            "inspect".to_string(),
            enclave_name.to_string(),
        ];
        let stdout = self.exec(cancel, &args).await?;
        Ok(parse_enclave_inspect(&stdout))
    }

    async fn wait_for_services(
        &self,
        cancel: &CancellationToken,
        enclave_name: &str,
        service_names: &[String],
        timeout: Duration,
    ) -> Result<()> {
        let resource = format!("services in enclave {enclave_name}");
        poll_until(&resource, self.poll_interval, timeout, cancel, || async move {
            match self.get_services(cancel, enclave_name).await {
                Ok(services) => Ok(all_running(&services, service_names).then_some(())),
                Err(Error::Cancelled) => Err(Error::Cancelled),
                Err(e) => {
                    tracing::trace!("Inspecting enclave {} failed: {}", enclave_name, e);
                    Ok(None)
                }
            }
        })
        .await
    }

    async fn stop_enclave(&self, cancel: &CancellationToken, enclave_name: &str) -> Result<()> {
        let args = [
            "enclave".to_string(),
            "stop".to_string(),
            enclave_name.to_string(),
        ];
        self.exec(cancel, &args).await.map(|_| ())
    }

    async fn destroy_enclave(&self, cancel: &CancellationToken, enclave_name: &str) -> Result<()> {
        let args = [
            "enclave".to_string(),
            "rm".to_string(),
            "-f".to_string(),
            enclave_name.to_string(),
        ];
        self.exec(cancel, &args).await.map(|_| ())
    }
}

/// Column offsets of the user services table
struct Columns {
    uuid: usize,
    name: usize,
    ports: usize,
    status: usize,
}

impl Columns {
    fn from_header(header: &str) -> Option<Self> {
        Some(Self {
            uuid: header.find("UUID")?,
            name: header.find("Name")?,
            ports: header.find("Ports")?,
            status: header.find("Status")?,
        })
    }
}

fn column(line: &str, start: usize, end: Option<usize>) -> &str {
    let end = end.unwrap_or(line.len()).min(line.len());
    if start >= end {
        return "";
    }
    line.get(start..end).unwrap_or("").trim()
}

/// Parse the "User Services" table printed by `kurtosis enclave inspect`.
///
/// Rows look like
/// `<uuid>  <name>  <port>: <number>/<proto> [-> <url>]  <status>`, with extra
/// ports on continuation lines whose UUID and name columns are blank.
pub fn parse_enclave_inspect(output: &str) -> HashMap<String, ServiceInfo> {
    let mut services = HashMap::new();

    let mut lines = output
        .lines()
        .skip_while(|line| !(line.starts_with('=') && line.contains(USER_SERVICES_SECTION)))
        .skip(1)
        .skip_while(|line| line.trim().is_empty());

    let Some(columns) = lines.next().and_then(Columns::from_header) else {
        return services;
    };

    let mut current: Option<ServiceInfo> = None;
    for line in lines {
        if line.starts_with('=') {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let uuid = column(line, columns.uuid, Some(columns.name));
        let ports = column(line, columns.ports, Some(columns.status));

        if !uuid.is_empty() {
            if let Some(service) = current.take() {
                services.insert(service.name.clone(), service);
            }
            let name = column(line, columns.name, Some(columns.ports)).to_string();
            current = Some(ServiceInfo {
                hostname: name.clone(),
                name,
                uuid: uuid.to_string(),
                status: column(line, columns.status, None).to_string(),
                ..Default::default()
            });
        }

        if let (Some(service), Some((port_name, port))) = (current.as_mut(), parse_port(ports)) {
            service.ports.insert(port_name, port);
        }
    }

    if let Some(service) = current.take() {
        services.insert(service.name.clone(), service);
    }

    services
}

/// Parse `rpc: 8545/tcp -> http://127.0.0.1:32769`
fn parse_port(text: &str) -> Option<(String, PortInfo)> {
    let (name, rest) = text.split_once(':')?;
    let (mapping, url) = match rest.split_once("->") {
        Some((mapping, url)) => (mapping.trim(), Some(url.trim().to_string())),
        None => (rest.trim(), None),
    };
    let (number, protocol) = mapping.split_once('/').unwrap_or((mapping, "tcp"));
    let number = number.trim().parse().ok()?;

    Some((
        name.trim().to_string(),
        PortInfo {
            number,
            protocol: protocol.trim().to_string(),
            url: url.filter(|u| !u.is_empty()),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSPECT_OUTPUT: &str = "\
Name:            devnet-test
UUID:            0a1b2c3d4e5f
Status:          RUNNING
Creation Time:   Mon, 19 Oct 2026 10:00:00 UTC
Flags:

========================================= Files Artifacts =========================================
UUID           Name
1a2b3c4d5e6f   el_cl_genesis_data

========================================== User Services ==========================================
UUID           Name                   Ports                                         Status
0c1d2e3f4a5b   apache                 http: 80/tcp -> http://127.0.0.1:32800        RUNNING
a1b2c3d4e5f6   cl-1-lighthouse-geth   http: 4000/tcp -> http://127.0.0.1:32780      RUNNING
                                      metrics: 5054/tcp -> http://127.0.0.1:32781
                                      tcp-discovery: 9000/tcp -> 127.0.0.1:32782
                                      udp-discovery: 9000/udp -> 127.0.0.1:32767
b2c3d4e5f6a7   el-1-geth-lighthouse   engine-rpc: 8551/tcp -> 127.0.0.1:32771       RUNNING
                                      rpc: 8545/tcp -> http://127.0.0.1:32773
                                      ws: 8546/tcp -> 127.0.0.1:32774
c3d4e5f6a7b8   vc-1-geth-lighthouse   <none>                                        STOPPED
";

    #[test]
    fn test_parse_enclave_inspect() {
        let services = parse_enclave_inspect(INSPECT_OUTPUT);
        assert_eq!(services.len(), 4);

        let beacon = &services["cl-1-lighthouse-geth"];
        assert_eq!(beacon.uuid, "a1b2c3d4e5f6");
        assert_eq!(beacon.status, "RUNNING");
        assert_eq!(beacon.ports.len(), 4);
        assert_eq!(beacon.ports["http"].number, 4000);
        assert_eq!(
            beacon.ports["http"].url.as_deref(),
            Some("http://127.0.0.1:32780")
        );
        assert_eq!(beacon.ports["udp-discovery"].protocol, "udp");

        let execution = &services["el-1-geth-lighthouse"];
        assert_eq!(execution.ports["rpc"].number, 8545);
        assert_eq!(
            execution.ports["engine-rpc"].url.as_deref(),
            Some("127.0.0.1:32771")
        );

        let validator = &services["vc-1-geth-lighthouse"];
        assert!(validator.ports.is_empty());
        assert!(!validator.is_running());
    }

    #[test]
    fn test_parse_enclave_inspect_without_services() {
        assert!(parse_enclave_inspect("Name: empty\nStatus: RUNNING\n").is_empty());
    }

    #[test]
    fn test_parse_port_without_mapping() {
        let (name, port) = parse_port("rpc: 8545/tcp").unwrap();
        assert_eq!(name, "rpc");
        assert_eq!(port.number, 8545);
        assert_eq!(port.url, None);
        assert!(parse_port("<none>").is_none());
    }
}
