// Copyright 2025 The Tract Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The workspace: one shared store file, many tracts. Spawn pointers and
//! imports across tracts are valid because every tract lives in the same
//! store.

use std::path::Path;
use std::sync::Arc;

use crate::config::OperationConfigs;
use crate::object_id::TractId;
use crate::store::Store;
use crate::store::TractInfo;
use crate::tract::Capabilities;
use crate::tract::Tract;
use crate::tract::TractError;
use crate::tract::TractResult;

pub struct Workspace {
    store: Arc<Store>,
    capabilities: Capabilities,
    configs: OperationConfigs,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Workspace")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Workspace {
    /// Opens (creating if needed) the store at `path`.
    pub fn open(path: &Path, capabilities: Capabilities) -> TractResult<Self> {
        Ok(Self {
            store: Store::open(path)?,
            capabilities,
            configs: OperationConfigs::default(),
        })
    }

    pub fn with_configs(mut self, configs: OperationConfigs) -> Self {
        self.configs = configs;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Creates a new tract and returns a handle on it. Its HEAD starts
    /// attached to an unborn `main` branch.
    pub fn create_tract(&self, name: &str) -> TractResult<Tract> {
        let id = self.store.create_tract(name)?;
        Ok(self.handle(id))
    }

    /// Opens a handle on an existing tract.
    pub fn open_tract(&self, id: &TractId) -> TractResult<Tract> {
        if !self.store.tract_exists(id)? {
            return Err(TractError::Store(
                crate::store::StoreError::UnknownTract(id.clone()),
            ));
        }
        Ok(self.handle(id.clone()))
    }

    pub fn list_tracts(&self) -> TractResult<Vec<TractInfo>> {
        Ok(self.store.list_tracts()?)
    }

    pub(crate) fn handle(&self, id: TractId) -> Tract {
        Tract::new(
            self.store.clone(),
            id,
            self.capabilities.clone(),
            self.configs.clone(),
        )
    }
}
