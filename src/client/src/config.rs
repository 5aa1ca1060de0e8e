// Copyright 2022 Singularity Data
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Client configuration, loadable from TOML.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pool::PoolSizerConfig;
use crate::refresh::RefreshConfig;

pub const DEFAULT_ENDPOINT: &str = "https://tabledata.cellstore.io:443";
pub const DEFAULT_POOL_SIZE: usize = 3;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Project the client acts on behalf of.
    pub project: String,
    /// Opaque bearer token attached to every request when present.
    pub credentials: Option<String>,
    pub endpoint: String,
    /// Number of pooled channels.
    pub pool_size: usize,
    /// Plaintext emulator target. When set, TLS and channel refresh are
    /// skipped and `endpoint` is ignored.
    pub emulator_host: Option<String>,
    pub user_agent: String,
    pub refresh: RefreshOptions,
    /// Dynamic pool sizing; disabled unless configured.
    pub sizer: Option<SizerOptions>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            credentials: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            emulator_host: None,
            user_agent: concat!("cellstore-client/", env!("CARGO_PKG_VERSION")).to_string(),
            refresh: RefreshOptions::default(),
            sizer: None,
        }
    }
}

impl ClientConfig {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Default::default()
        }
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: ClientConfig = toml::from_str(raw)
            .map_err(|err| Error::Config(format!("failed to parse client config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.project.is_empty() {
            return Err(Error::Config("project must not be empty".to_string()));
        }
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".to_string()));
        }
        if self.refresh.refresh_min_s > self.refresh.refresh_max_s {
            return Err(Error::Config(
                "refresh_min_s must not exceed refresh_max_s".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshOptions {
    pub refresh_min_s: u64,
    pub refresh_max_s: u64,
    pub grace_period_s: u64,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            refresh_min_s: 35 * 60,
            refresh_max_s: 45 * 60,
            grace_period_s: 10 * 60,
        }
    }
}

impl From<&RefreshOptions> for RefreshConfig {
    fn from(options: &RefreshOptions) -> Self {
        Self {
            refresh_min: Duration::from_secs(options.refresh_min_s),
            refresh_max: Duration::from_secs(options.refresh_max_s),
            grace_period: Duration::from_secs(options.grace_period_s),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SizerOptions {
    pub interval_s: u64,
    pub min_channels: usize,
    pub max_channels: usize,
    pub max_rpcs_per_channel: usize,
    pub max_resize_delta: usize,
}

impl Default for SizerOptions {
    fn default() -> Self {
        Self {
            interval_s: 60,
            min_channels: 1,
            max_channels: 10,
            max_rpcs_per_channel: 100,
            max_resize_delta: 2,
        }
    }
}

impl From<&SizerOptions> for PoolSizerConfig {
    fn from(options: &SizerOptions) -> Self {
        Self {
            interval: Duration::from_secs(options.interval_s),
            min_channels: options.min_channels,
            max_channels: options.max_channels,
            max_rpcs_per_channel: options.max_rpcs_per_channel,
            max_resize_delta: options.max_resize_delta,
        }
    }
}
