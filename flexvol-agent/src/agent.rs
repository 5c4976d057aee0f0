// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serves one driver invocation against the cloud and this host.

use crate::config::Config;
use crate::operation::{ExecResult, Request};
use crate::Error;
use blockdev_utils::host;
use blockdev_utils::lsblk::BlockDevice;
use slog::{error, info, o, Logger};
use std::sync::Arc;
use vcd_client::{Connector, VAppVm};

pub struct Agent {
    log: Logger,
    config: Config,
    node_name: String,
    connector: Arc<dyn Connector>,
    host: Arc<dyn host::Api>,
}

/// Everything a single mount or unmount works with once the cloud session
/// is open.
pub(crate) struct Context<'a> {
    pub log: &'a Logger,
    pub config: &'a Config,
    pub cloud: &'a dyn vcd_client::Api,
    pub host: &'a dyn host::Api,
    /// This node's VM.
    pub vm: &'a VAppVm,
}

impl Context<'_> {
    pub(crate) async fn snapshot(
        &self,
        step: &'static str,
    ) -> Result<Vec<BlockDevice>, Error> {
        self.host.block_devices().await.map_err(Error::host(step))
    }
}

impl Agent {
    pub fn new(
        log: &Logger,
        config: Config,
        node_name: String,
        connector: Arc<dyn Connector>,
        host: Arc<dyn host::Api>,
    ) -> Self {
        let log = log.new(o!("node" => node_name.clone()));
        Agent { log, config, node_name, connector, host }
    }

    /// Serves `request`, turning any error into a failure reply.
    pub async fn run(&self, request: Request) -> ExecResult {
        match self.execute(request).await {
            Ok(result) => result,
            Err(err) => {
                error!(self.log, "request failed"; "error" => %err);
                ExecResult::failure(&err)
            }
        }
    }

    pub async fn execute(&self, request: Request) -> Result<ExecResult, Error> {
        match request {
            Request::Init => Ok(ExecResult::init()),
            Request::NotSupported(callout) => {
                info!(self.log, "unsupported callout"; "callout" => callout);
                Ok(ExecResult::not_supported())
            }
            Request::Mount(request) => {
                let log = self.log.new(o!(
                    "op" => "mount",
                    "mount_dir" => request.mount_dir.clone(),
                ));
                let plan = crate::mount::validate(&request)?;
                let (cloud, vm) = self.open_session(&log).await?;
                let cx = self.context(&log, cloud.as_ref(), &vm);
                let binding = cx.mount(&plan).await?;
                Ok(ExecResult::bound(&binding))
            }
            Request::Unmount(request) => {
                let log = self.log.new(o!(
                    "op" => "unmount",
                    "mount_dir" => request.mount_dir.clone(),
                ));
                if self.config.manual_unmount {
                    info!(log, "unmount is manual; leaving disk attached");
                    return Ok(ExecResult::success("manual unmount"));
                }
                let mount_dir = crate::unmount::validate(&request)?;
                let (cloud, vm) = self.open_session(&log).await?;
                let cx = self.context(&log, cloud.as_ref(), &vm);
                let binding = cx.unmount(&mount_dir).await?;
                Ok(ExecResult::bound(&binding))
            }
        }
    }

    async fn open_session(
        &self,
        log: &Logger,
    ) -> Result<(Arc<dyn vcd_client::Api>, VAppVm), Error> {
        let cloud = self
            .connector
            .connect()
            .await
            .map_err(Error::cloud("connect to cloud director"))?;
        let vm = cloud
            .find_vm(&self.config.vcd.vapp, &self.node_name)
            .await
            .map_err(Error::cloud("find this node's VM"))?;
        info!(log, "found node VM"; "vm" => &vm.name, "href" => &vm.href);
        Ok((cloud, vm))
    }

    fn context<'a>(
        &'a self,
        log: &'a Logger,
        cloud: &'a dyn vcd_client::Api,
        vm: &'a VAppVm,
    ) -> Context<'a> {
        Context { log, config: &self.config, cloud, host: self.host.as_ref(), vm }
    }
}
