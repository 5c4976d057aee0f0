// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JSON client for the cloud director REST API.

use crate::task::{Progress, Task, Tasks};
use crate::types::{AttachedVm, Disk, VAppVm};
use crate::{Api, Connector, Error};
use reqwest::header::{HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use slog::{debug, info, o, Logger};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MIB: u64 = 1 << 20;

const ACCESS_TOKEN_HEADER: &str = "x-vmware-vcloud-access-token";
const LEGACY_TOKEN_HEADER: &str = "x-vcloud-authorization";

const DISK_CREATE_PARAMS: &str =
    "application/vnd.vmware.vcloud.diskCreateParams+json";
const DISK_ATTACH_OR_DETACH_PARAMS: &str =
    "application/vnd.vmware.vcloud.diskAttachOrDetachParams+json";
const DISK: &str = "application/vnd.vmware.vcloud.disk+json";

fn default_api_version() -> String {
    "36.0".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_task_poll_interval_secs() -> u64 {
    3
}

/// Where and as whom to connect.
#[derive(Clone, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base of the REST API, e.g. `https://vcd.example.com/api`.
    pub api_endpoint: String,
    /// Skip TLS certificate verification.
    #[serde(default)]
    pub insecure: bool,
    pub user: String,
    pub password: String,
    pub org: String,
    pub vdc: String,
    /// The vApp whose VMs are the cluster nodes.
    pub vapp: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_task_poll_interval_secs")]
    pub task_poll_interval_secs: u64,
    /// Give up waiting on a task after this long. Unbounded when unset.
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_endpoint", &self.api_endpoint)
            .field("insecure", &self.insecure)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("org", &self.org)
            .field("vdc", &self.vdc)
            .field("vapp", &self.vapp)
            .field("api_version", &self.api_version)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("task_poll_interval_secs", &self.task_poll_interval_secs)
            .field("task_timeout_secs", &self.task_timeout_secs)
            .finish()
    }
}

mod wire {
    use crate::task::Tasks;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Deserialize)]
    pub struct QueryRecords {
        #[serde(default)]
        pub record: Vec<Record>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Record {
        pub href: String,
        pub name: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Disk {
        #[serde(default)]
        pub id: String,
        pub name: String,
        pub href: String,
        #[serde(default)]
        pub description: Option<String>,
        #[serde(default)]
        pub size_mb: Option<u64>,
        // Bytes; reported by older API versions only.
        #[serde(default)]
        pub size: Option<u64>,
        #[serde(default)]
        pub tasks: Option<Tasks>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct VmReferences {
        #[serde(default)]
        pub vm_reference: Vec<Reference>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Reference {
        pub href: String,
        #[serde(default)]
        pub id: Option<String>,
        #[serde(default)]
        pub name: Option<String>,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct DiskParams<'a> {
        pub name: &'a str,
        pub size_mb: u64,
        pub description: &'a str,
    }

    #[derive(Debug, Serialize)]
    pub struct DiskCreateParams<'a> {
        pub disk: DiskParams<'a>,
    }

    #[derive(Debug, Serialize)]
    pub struct HrefRef<'a> {
        pub href: &'a str,
    }

    #[derive(Debug, Serialize)]
    pub struct DiskAttachOrDetachParams<'a> {
        pub disk: HrefRef<'a>,
    }
}

/// An authenticated session scoped to one organization VDC.
pub struct Client {
    log: Logger,
    http: reqwest::Client,
    base: Url,
    accept: HeaderValue,
    auth: (HeaderName, HeaderValue),
    vdc_href: String,
    poll_interval: Duration,
    task_timeout: Option<Duration>,
}

fn parse_endpoint(endpoint: &str) -> Result<Url, Error> {
    let invalid = |message: String| Error::Endpoint {
        endpoint: endpoint.to_string(),
        message,
    };
    // Url::join replaces the last path segment unless the base ends in '/'.
    let with_slash = if endpoint.ends_with('/') {
        endpoint.to_string()
    } else {
        format!("{endpoint}/")
    };
    let url = Url::parse(&with_slash).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "https" | "http" => Ok(url),
        other => Err(invalid(format!("unsupported scheme {other:?}"))),
    }
}

fn size_mb(size_bytes: u64) -> u64 {
    size_bytes.div_ceil(MIB).max(1)
}

impl Client {
    /// Logs in and resolves the configured VDC.
    pub async fn connect(log: &Logger, config: &Config) -> Result<Self, Error> {
        let log = log.new(o!(
            "component" => "VcdClient",
            "org" => config.org.clone(),
            "vdc" => config.vdc.clone(),
        ));
        let base = parse_endpoint(&config.api_endpoint)?;
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let http = reqwest::ClientBuilder::new()
            .connect_timeout(timeout)
            .timeout(timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|err| Error::Http { url: base.to_string(), err })?;
        let accept = HeaderValue::from_str(&format!(
            "application/*+json;version={}",
            config.api_version
        ))
        .map_err(|e| Error::Endpoint {
            endpoint: config.api_endpoint.clone(),
            message: format!("invalid API version: {e}"),
        })?;

        let url = join(&base, "sessions")?;
        info!(log, "logging in"; "url" => %url, "user" => &config.user);
        let response = http
            .post(url.clone())
            .basic_auth(
                format!("{}@{}", config.user, config.org),
                Some(&config.password),
            )
            .header(ACCEPT, accept.clone())
            .send()
            .await
            .map_err(|err| Error::Http { url: url.to_string(), err })?;
        if !response.status().is_success() {
            return Err(Error::Login(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let headers = response.headers();
        let auth = if let Some(token) = headers.get(ACCESS_TOKEN_HEADER) {
            let bearer = format!(
                "Bearer {}",
                token.to_str().map_err(|e| Error::Login(e.to_string()))?
            );
            (
                reqwest::header::AUTHORIZATION,
                HeaderValue::from_str(&bearer)
                    .map_err(|e| Error::Login(e.to_string()))?,
            )
        } else if let Some(token) = headers.get(LEGACY_TOKEN_HEADER) {
            (HeaderName::from_static(LEGACY_TOKEN_HEADER), token.clone())
        } else {
            return Err(Error::Login(
                "response carried no session token".to_string(),
            ));
        };

        let mut client = Client {
            log,
            http,
            base,
            accept,
            auth,
            vdc_href: String::new(),
            poll_interval: Duration::from_secs(config.task_poll_interval_secs),
            task_timeout: config.task_timeout_secs.map(Duration::from_secs),
        };
        let vdc = client
            .query_one("orgVdc", &config.vdc, &format!("name=={}", config.vdc))
            .await?;
        client.vdc_href = vdc.href;
        debug!(client.log, "resolved VDC"; "href" => &client.vdc_href);
        Ok(client)
    }

    /// Parses an href returned by the API, refusing to follow it anywhere
    /// other than the server we logged in to.
    fn checked_href(&self, href: &str) -> Result<Url, Error> {
        let url =
            Url::parse(href).map_err(|_| Error::InvalidHref(href.to_string()))?;
        if url.origin() != self.base.origin() {
            return Err(Error::InvalidHref(href.to_string()));
        }
        Ok(url)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<(&'static str, Vec<u8>)>,
    ) -> Result<T, Error> {
        let mut builder = self
            .http
            .request(method.clone(), url.clone())
            .header(ACCEPT, self.accept.clone())
            .header(self.auth.0.clone(), self.auth.1.clone());
        if let Some((content_type, body)) = body {
            builder = builder.header(CONTENT_TYPE, content_type).body(body);
        }
        debug!(self.log, "request"; "method" => %method, "url" => %url);
        let response = builder
            .send()
            .await
            .map_err(|err| Error::Http { url: url.to_string(), err })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Protocol {
                url: url.to_string(),
                message: format!("status {status}: {}", text.trim()),
            });
        }
        response
            .json()
            .await
            .map_err(|err| Error::Http { url: url.to_string(), err })
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, Error> {
        self.request(Method::GET, url, None).await
    }

    async fn send<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        content_type: &'static str,
        body: &B,
    ) -> Result<T, Error> {
        let body = serde_json::to_vec(body).map_err(|e| Error::Protocol {
            url: url.to_string(),
            message: format!("failed to encode request: {e}"),
        })?;
        self.request(method, url, Some((content_type, body))).await
    }

    async fn query(
        &self,
        kind: &'static str,
        filter: &str,
    ) -> Result<Vec<wire::Record>, Error> {
        let mut url = join(&self.base, "query")?;
        url.query_pairs_mut()
            .append_pair("type", kind)
            .append_pair("format", "records")
            .append_pair("pageSize", "128")
            .append_pair("filter", filter);
        let records: wire::QueryRecords = self.get(url).await?;
        Ok(records.record)
    }

    async fn query_one(
        &self,
        kind: &'static str,
        name: &str,
        filter: &str,
    ) -> Result<wire::Record, Error> {
        let mut records = self.query(kind, filter).await?;
        match records.len() {
            0 => Err(Error::NotFound { kind, name: name.to_string() }),
            1 => Ok(records.remove(0)),
            count => {
                Err(Error::Duplicate { kind, name: name.to_string(), count })
            }
        }
    }

    async fn wait_for_task(&self, task: Task) -> Result<(), Error> {
        let deadline = self.task_timeout.map(|t| (Instant::now() + t, t));
        let mut task = task;
        loop {
            match task.progress() {
                Progress::Succeeded => return Ok(()),
                Progress::Failed => {
                    return Err(Error::Task {
                        message: task.error_message(),
                        href: task.href,
                        status: task.status,
                    });
                }
                Progress::Pending => {}
            }
            if let Some((deadline, timeout)) = deadline {
                if Instant::now() >= deadline {
                    return Err(Error::TaskTimeout { href: task.href, timeout });
                }
            }
            tokio::time::sleep(self.poll_interval).await;
            let url = self.checked_href(&task.href)?;
            task = self.get(url).await?;
        }
    }

    async fn wait_for_tasks(&self, tasks: Option<Tasks>) -> Result<(), Error> {
        for task in tasks.unwrap_or_default().task {
            self.wait_for_task(task).await?;
        }
        Ok(())
    }

    async fn disk_from_wire(&self, disk: wire::Disk) -> Result<Disk, Error> {
        let url = join(&self.checked_href(&disk.href)?, "attachedVms")?;
        let refs: wire::VmReferences = self.get(url).await?;
        Ok(convert_disk(disk, refs))
    }
}

fn join(base: &Url, segment: &str) -> Result<Url, Error> {
    let base = if base.path().ends_with('/') {
        base.clone()
    } else {
        let mut with_slash = base.clone();
        with_slash.set_path(&format!("{}/", base.path()));
        with_slash
    };
    base.join(segment).map_err(|e| Error::Endpoint {
        endpoint: base.to_string(),
        message: e.to_string(),
    })
}

fn convert_disk(disk: wire::Disk, refs: wire::VmReferences) -> Disk {
    let size_bytes =
        disk.size_mb.map(|mb| mb * MIB).or(disk.size).unwrap_or_default();
    let attached_vm = refs.vm_reference.into_iter().next().map(|vm| {
        AttachedVm {
            id: vm.id.unwrap_or_default(),
            name: vm.name.unwrap_or_default(),
            href: vm.href,
        }
    });
    Disk {
        id: disk.id,
        name: disk.name,
        href: disk.href,
        size_bytes,
        description: disk.description.unwrap_or_default(),
        attached_vm,
    }
}

#[async_trait::async_trait]
impl Api for Client {
    async fn find_vm(&self, vapp: &str, vm_name: &str) -> Result<VAppVm, Error> {
        let record = self
            .query_one(
                "vm",
                vm_name,
                &format!("name=={vm_name};containerName=={vapp}"),
            )
            .await?;
        self.checked_href(&record.href)?;
        Ok(VAppVm { name: record.name, href: record.href })
    }

    async fn find_disk_by_name(&self, name: &str) -> Result<Disk, Error> {
        let record = self
            .query_one(
                "disk",
                name,
                &format!("name=={name};vdc=={}", self.vdc_href),
            )
            .await?;
        let disk: wire::Disk = self.get(self.checked_href(&record.href)?).await?;
        self.disk_from_wire(disk).await
    }

    async fn create_disk(
        &self,
        name: &str,
        size_bytes: u64,
    ) -> Result<Disk, Error> {
        let url = join(&self.checked_href(&self.vdc_href)?, "disk")?;
        info!(self.log, "creating disk"; "name" => name, "size" => size_bytes);
        let params = wire::DiskCreateParams {
            disk: wire::DiskParams {
                name,
                size_mb: size_mb(size_bytes),
                description: "",
            },
        };
        let created: wire::Disk =
            self.send(Method::POST, url, DISK_CREATE_PARAMS, &params).await?;
        self.wait_for_tasks(created.tasks).await?;
        self.find_disk_by_name(name).await
    }

    async fn attach_disk(&self, vm: &VAppVm, disk: &Disk) -> Result<(), Error> {
        let url = join(&self.checked_href(&vm.href)?, "disk/action/attach")?;
        info!(self.log, "attaching disk"; "disk" => &disk.name, "vm" => &vm.name);
        let params = wire::DiskAttachOrDetachParams {
            disk: wire::HrefRef { href: &disk.href },
        };
        let task: Task = self
            .send(Method::POST, url, DISK_ATTACH_OR_DETACH_PARAMS, &params)
            .await?;
        self.wait_for_task(task).await
    }

    async fn detach_disk(&self, vm: &VAppVm, disk: &Disk) -> Result<(), Error> {
        let url = join(&self.checked_href(&vm.href)?, "disk/action/detach")?;
        info!(self.log, "detaching disk"; "disk" => &disk.name, "vm" => &vm.name);
        let params = wire::DiskAttachOrDetachParams {
            disk: wire::HrefRef { href: &disk.href },
        };
        let task: Task = self
            .send(Method::POST, url, DISK_ATTACH_OR_DETACH_PARAMS, &params)
            .await?;
        self.wait_for_task(task).await
    }

    async fn set_disk_description(
        &self,
        disk: &Disk,
        description: &str,
    ) -> Result<(), Error> {
        let url = self.checked_href(&disk.href)?;
        debug!(self.log, "updating disk description"; "disk" => &disk.name);
        let params = wire::DiskParams {
            name: &disk.name,
            size_mb: size_mb(disk.size_bytes),
            description,
        };
        let task: Task = self.send(Method::PUT, url, DISK, &params).await?;
        self.wait_for_task(task).await
    }
}

/// Connects a fresh [`Client`] for every invocation.
pub struct ClientConnector {
    log: Logger,
    config: Config,
}

impl ClientConnector {
    pub fn new(log: &Logger, config: Config) -> Self {
        Self { log: log.clone(), config }
    }
}

#[async_trait::async_trait]
impl Connector for ClientConnector {
    async fn connect(&self) -> Result<Arc<dyn Api>, Error> {
        let client = Client::connect(&self.log, &self.config).await?;
        Ok(Arc::new(client))
    }
}
