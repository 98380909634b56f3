//! Entry points exposed to API drivers
//!
//! Objects live in typed arenas and are referred to by [`Handle`]s that
//! carry a generation count, so a handle to a deleted object (or a slot
//! reused by a newer object) is rejected with `IncorrectObject`. Every entry
//! point returns a [`StatusCode`] on failure; internal errors are logged
//! here and nowhere else.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use oa_metrics_shared::{Error, MetricsConfig, ReportApi, Result, StatusCode};
use tracing::{debug, error, instrument};

use crate::configuration::{
    Configuration, ConfigurationCreateData, OaConfiguration, UserConfiguration,
};
use crate::context::Context;
use crate::gpu::buffer::{CommandBuffer, SizeCalculator};
use crate::kernel::memory::GpuMemoryAllocator;
use crate::kernel::IoControl;
use crate::query::{CopyReportsData, HwCounterQuery, QueryWriteData};
use crate::sub_device::SubDeviceClientData;

/// Interface version implemented by this library.
pub const INTERFACE_VERSION_MAJOR: u32 = 1;
pub const INTERFACE_VERSION_MINOR: u32 = 0;

pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

/// Slot storage with generation-checked handles.
struct Arena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    kind: &'static str,
}

impl<T> Arena<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            kind,
        }
    }

    fn insert(&mut self, value: T) -> Handle<T> {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            let generation = match entry {
                Entry::Vacant { generation } => generation.wrapping_add(1),
                Entry::Occupied { generation, .. } => *generation,
            };
            *entry = Entry::Occupied { generation, value };
            return Handle::new(index, generation);
        }

        let index = self.entries.len() as u32;
        self.entries.push(Entry::Occupied {
            generation: 0,
            value,
        });
        Handle::new(index, 0)
    }

    fn get(&self, handle: Handle<T>) -> Result<&T> {
        match self.entries.get(handle.index as usize) {
            Some(Entry::Occupied { generation, value }) if *generation == handle.generation => {
                Ok(value)
            }
            _ => Err(Error::IncorrectObject(self.kind)),
        }
    }

    fn get_mut(&mut self, handle: Handle<T>) -> Result<&mut T> {
        match self.entries.get_mut(handle.index as usize) {
            Some(Entry::Occupied { generation, value }) if *generation == handle.generation => {
                Ok(value)
            }
            _ => Err(Error::IncorrectObject(self.kind)),
        }
    }

    fn remove(&mut self, handle: Handle<T>) -> Result<T> {
        self.get(handle)?;
        let entry = std::mem::replace(
            &mut self.entries[handle.index as usize],
            Entry::Vacant {
                generation: handle.generation,
            },
        );
        self.free.push(handle.index);
        match entry {
            Entry::Occupied { value, .. } => Ok(value),
            Entry::Vacant { .. } => Err(Error::IncorrectObject(self.kind)),
        }
    }

    fn handles(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { generation, value } => {
                    Some((Handle::new(index as u32, *generation), value))
                }
                Entry::Vacant { .. } => None,
            })
    }

    fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }
}

pub struct QueryObject {
    context: Handle<Context>,
    query: HwCounterQuery,
}

pub struct ConfigurationObject {
    context: Handle<Context>,
    configuration: Configuration,
}

/// What a command buffer request should emit.
#[derive(Debug, Clone, Copy)]
pub enum CommandBufferData {
    QueryWrite {
        query: Handle<QueryObject>,
        data: QueryWriteData,
    },
    CopyReports {
        source: Handle<QueryObject>,
        target: Handle<QueryObject>,
        data: CopyReportsData,
    },
}

/// Top-level library instance.
pub struct MetricsLibrary {
    io: Arc<dyn IoControl>,
    allocator: Arc<dyn GpuMemoryAllocator>,
    config: MetricsConfig,
    contexts: Arena<Context>,
    queries: Arena<QueryObject>,
    configurations: Arena<ConfigurationObject>,
}

fn fail(operation: &'static str) -> impl Fn(Error) -> StatusCode {
    move |e| {
        error!(operation, error = %e, "metrics library call failed");
        e.status()
    }
}

impl MetricsLibrary {
    /// Open the library for a client built against `major.minor`.
    pub fn open(
        major: u32,
        minor: u32,
        io: Arc<dyn IoControl>,
        allocator: Arc<dyn GpuMemoryAllocator>,
        config: MetricsConfig,
    ) -> std::result::Result<Self, StatusCode> {
        if major != INTERFACE_VERSION_MAJOR {
            return Err(fail("open")(Error::IncorrectVersion { major, minor }));
        }
        config.validate().map_err(fail("open"))?;

        debug!(major, minor, "metrics library opened");
        Ok(Self {
            io,
            allocator,
            config,
            contexts: Arena::new("context"),
            queries: Arena::new("query"),
            configurations: Arena::new("configuration"),
        })
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn context(&self, handle: Handle<Context>) -> std::result::Result<&Context, StatusCode> {
        self.contexts.get(handle).map_err(|e| e.status())
    }

    pub fn query(&self, handle: Handle<QueryObject>) -> std::result::Result<&HwCounterQuery, StatusCode> {
        self.queries
            .get(handle)
            .map(|q| &q.query)
            .map_err(|e| e.status())
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    #[instrument(skip(self))]
    pub fn context_create(
        &mut self,
        client: Option<SubDeviceClientData>,
    ) -> std::result::Result<Handle<Context>, StatusCode> {
        let context = Context::create(
            self.io.clone(),
            self.allocator.clone(),
            client,
            self.config.clone(),
        )
        .map_err(fail("context_create"))?;
        Ok(self.contexts.insert(context))
    }

    /// Delete a context together with the queries and configurations created on it.
    #[instrument(skip(self))]
    pub fn context_delete(&mut self, handle: Handle<Context>) -> std::result::Result<(), StatusCode> {
        self.contexts.get(handle).map_err(fail("context_delete"))?;

        let queries: Vec<_> = self
            .queries
            .handles()
            .filter(|(_, q)| q.context == handle)
            .map(|(h, _)| h)
            .collect();
        for query in queries {
            self.queries.remove(query).map_err(fail("context_delete"))?;
        }

        let configurations: Vec<_> = self
            .configurations
            .handles()
            .filter(|(_, c)| c.context == handle)
            .map(|(h, _)| h)
            .collect();
        for configuration in configurations {
            self.configuration_delete(configuration)?;
        }

        self.contexts.remove(handle).map_err(fail("context_delete"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn query_create(
        &mut self,
        context: Handle<Context>,
        slot_count: u32,
    ) -> std::result::Result<Handle<QueryObject>, StatusCode> {
        let ctx = self.contexts.get(context).map_err(fail("query_create"))?;
        let query = HwCounterQuery::create(ctx, slot_count).map_err(fail("query_create"))?;
        Ok(self.queries.insert(QueryObject { context, query }))
    }

    #[instrument(skip(self))]
    pub fn query_delete(&mut self, handle: Handle<QueryObject>) -> std::result::Result<(), StatusCode> {
        self.queries.remove(handle).map_err(fail("query_delete"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn configuration_create(
        &mut self,
        context: Handle<Context>,
        data: ConfigurationCreateData,
    ) -> std::result::Result<Handle<ConfigurationObject>, StatusCode> {
        let ctx = self
            .contexts
            .get(context)
            .map_err(fail("configuration_create"))?;

        let configuration = match data {
            ConfigurationCreateData::Oa { set_id } => {
                OaConfiguration::load(ctx.io(), set_id).map(Configuration::Oa)
            }
            ConfigurationCreateData::User { registers } => {
                UserConfiguration::new(registers).map(Configuration::User)
            }
        }
        .map_err(fail("configuration_create"))?;

        Ok(self.configurations.insert(ConfigurationObject {
            context,
            configuration,
        }))
    }

    #[instrument(skip(self))]
    pub fn configuration_activate(
        &mut self,
        handle: Handle<ConfigurationObject>,
    ) -> std::result::Result<(), StatusCode> {
        let object = self
            .configurations
            .get(handle)
            .map_err(fail("configuration_activate"))?;
        let context = self
            .contexts
            .get_mut(object.context)
            .map_err(fail("configuration_activate"))?;

        match &object.configuration {
            Configuration::Oa(oa) => context.activate_oa(oa),
            Configuration::User(user) => context.activate_user(user),
        }
        .map_err(fail("configuration_activate"))
    }

    #[instrument(skip(self))]
    pub fn configuration_deactivate(
        &mut self,
        handle: Handle<ConfigurationObject>,
    ) -> std::result::Result<(), StatusCode> {
        let object = self
            .configurations
            .get(handle)
            .map_err(fail("configuration_deactivate"))?;
        let context = self
            .contexts
            .get_mut(object.context)
            .map_err(fail("configuration_deactivate"))?;

        match &object.configuration {
            Configuration::Oa(oa) => context.deactivate_oa(oa),
            Configuration::User(user) => context.deactivate_user(user),
        }
        .map_err(fail("configuration_deactivate"))
    }

    /// Delete a configuration, deactivating it first when active.
    #[instrument(skip(self))]
    pub fn configuration_delete(
        &mut self,
        handle: Handle<ConfigurationObject>,
    ) -> std::result::Result<(), StatusCode> {
        let object = self
            .configurations
            .remove(handle)
            .map_err(fail("configuration_delete"))?;

        let Ok(context) = self.contexts.get_mut(object.context) else {
            return Ok(());
        };
        match &object.configuration {
            Configuration::Oa(oa) => {
                if context.is_active_oa(oa) {
                    context.deactivate_oa(oa).map_err(fail("configuration_delete"))?;
                }
                oa.unload(context.io()).map_err(fail("configuration_delete"))
            }
            Configuration::User(user) => {
                if context.is_active_user(user) {
                    context
                        .deactivate_user(user)
                        .map_err(fail("configuration_delete"))?;
                }
                Ok(())
            }
        }
    }

    /// Append the commands for `data` to `buffer`.
    #[instrument(skip(self, buffer))]
    pub fn command_buffer_get(
        &mut self,
        buffer: &mut dyn CommandBuffer,
        data: &CommandBufferData,
    ) -> std::result::Result<(), StatusCode> {
        self.emit(buffer, data).map_err(fail("command_buffer_get"))
    }

    /// Bytes [`command_buffer_get`](Self::command_buffer_get) would append.
    #[instrument(skip(self))]
    pub fn command_buffer_get_size(
        &mut self,
        data: &CommandBufferData,
    ) -> std::result::Result<usize, StatusCode> {
        let mut size = SizeCalculator::new();
        self.emit(&mut size, data)
            .map_err(fail("command_buffer_get_size"))?;
        Ok(size.bytes())
    }

    fn emit(&mut self, buffer: &mut dyn CommandBuffer, data: &CommandBufferData) -> Result<()> {
        match *data {
            CommandBufferData::QueryWrite { query, data } => {
                let object = self.queries.get_mut(query)?;
                let context = self.contexts.get(object.context)?;
                object.query.write(context, buffer, &data)
            }
            CommandBufferData::CopyReports {
                source,
                target,
                data,
            } => {
                let export = self
                    .queries
                    .get(source)?
                    .query
                    .export_slots(data.source_slot, data.slot_count)?;
                let object = self.queries.get_mut(target)?;
                let context = self.contexts.get(object.context)?;
                object
                    .query
                    .copy_reports(context, buffer, &export, data.target_slot)
            }
        }
    }

    /// Reports for `count` slots starting at `first`.
    ///
    /// Succeeds even when reports carry quality flags.
    #[instrument(skip(self))]
    pub fn get_data(
        &mut self,
        query: Handle<QueryObject>,
        first: u32,
        count: u32,
    ) -> std::result::Result<Vec<ReportApi>, StatusCode> {
        let object = self.queries.get_mut(query).map_err(fail("get_data"))?;
        let context = self.contexts.get(object.context).map_err(fail("get_data"))?;
        object
            .query
            .get_data(context, first, count)
            .map_err(fail("get_data"))
    }
}
