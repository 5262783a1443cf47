//! The composition root: regions, channels, dictionaries, lifecycle.
//!
//! One concrete `MlosContext` type with three constructors, differing
//! only in where the regions come from:
//!
//! - [`MlosContext::inter_process`] — named shared memory and named
//!   semaphores, for a target whose agent opens the same names;
//! - [`MlosContext::anonymous`] — `memfd` regions whose descriptors
//!   travel over the exchange socket, with a watcher thread re-sending
//!   them whenever the agent (re)starts;
//! - [`MlosContext::internal`] — private regions and spinning readers,
//!   for tests and single-process use.

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mlos_fdpass::{FdExchangeClient, WatchFile};
use mlos_primitives::sync::Ordering;
use mlos_primitives::{CreateDisposition, NamedSemaphore, SharedMemoryMap};

use crate::bootstrap::{
    SHARED_CONFIG_REGION_INDEX, channel_region_size, global_memory_region, setup_channel_region,
    setup_global_region, setup_shared_config_region,
};
use crate::channel::{SendStatus, SharedChannel};
use crate::config::{ComponentConfig, ConfigRecord};
use crate::dictionary::{ConfigDisposition, SharedConfigDictionary};
use crate::error::Error;
use crate::layout::{
    CONTROL_CHANNEL_EVENT_NAME, CONTROL_CHANNEL_MAP_NAME, DEFAULT_REGION_SIZE,
    DEFAULT_SOCKET_PATH, DEFAULT_WATCH_DIRECTORY, FEEDBACK_CHANNEL_EVENT_NAME,
    FEEDBACK_CHANNEL_MAP_NAME, GLOBAL_MEMORY_MAP_NAME, GlobalMemoryRegion, MemoryRegionId,
    RegionType, SHARED_CONFIG_MAP_NAME, TEST_GLOBAL_MEMORY_MAP_NAME, WATCH_FILE_NAME,
};
use crate::messages::{
    RegisterSettingsAssemblyRequest, RegisterSharedConfigMemoryRegionRequest, ShmMessage,
    TerminateReaderThreadRequest,
};
use crate::records::{
    RegisteredMemoryRegionConfig, RegisteredNamedEventConfig, RegisteredSettingsAssemblyConfig,
};
use crate::wake::{ChannelWake, WakePolicy};

/// The four standard maps; shared with the descriptor handout thread.
pub struct RegionSet {
    pub global: SharedMemoryMap,
    pub control: SharedMemoryMap,
    pub feedback: SharedMemoryMap,
    pub config: SharedMemoryMap,
}

impl RegionSet {
    fn descriptors(&self) -> [(&'static str, RawFd); 4] {
        [
            (GLOBAL_MEMORY_MAP_NAME, self.global.as_raw_fd()),
            (CONTROL_CHANNEL_MAP_NAME, self.control.as_raw_fd()),
            (FEEDBACK_CHANNEL_MAP_NAME, self.feedback.as_raw_fd()),
            (SHARED_CONFIG_MAP_NAME, self.config.as_raw_fd()),
        ]
    }
}

struct FdHandout {
    watch: Arc<WatchFile>,
    handle: Option<JoinHandle<()>>,
}

/// Options for [`MlosContext::inter_process_with`].
pub struct InterProcessOptions {
    pub global_memory_name: String,
    pub control_channel_name: String,
    pub feedback_channel_name: String,
    pub shared_config_name: String,
    pub control_event_name: String,
    pub feedback_event_name: String,
    /// Size of each region's usable payload (channel rings keep exactly
    /// this many bytes).
    pub region_size: usize,
}

impl Default for InterProcessOptions {
    fn default() -> Self {
        Self {
            global_memory_name: GLOBAL_MEMORY_MAP_NAME.into(),
            control_channel_name: CONTROL_CHANNEL_MAP_NAME.into(),
            feedback_channel_name: FEEDBACK_CHANNEL_MAP_NAME.into(),
            shared_config_name: SHARED_CONFIG_MAP_NAME.into(),
            control_event_name: CONTROL_CHANNEL_EVENT_NAME.into(),
            feedback_event_name: FEEDBACK_CHANNEL_EVENT_NAME.into(),
            region_size: DEFAULT_REGION_SIZE,
        }
    }
}

/// Options for [`MlosContext::anonymous_with`].
pub struct AnonymousOptions {
    pub socket_path: PathBuf,
    pub watch_directory: PathBuf,
    pub control_event_name: String,
    pub feedback_event_name: String,
    pub region_size: usize,
}

impl Default for AnonymousOptions {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.into(),
            watch_directory: DEFAULT_WATCH_DIRECTORY.into(),
            control_event_name: CONTROL_CHANNEL_EVENT_NAME.into(),
            feedback_event_name: FEEDBACK_CHANNEL_EVENT_NAME.into(),
            region_size: DEFAULT_REGION_SIZE,
        }
    }
}

/// Entry point for an application component talking to the agent.
///
/// Telemetry and control requests go out on the control channel (the
/// telemetry channel aliases it); configuration updates come back on
/// the feedback channel, which the application reads by running
/// [`SharedChannel::process_messages`] on reader threads.
pub struct MlosContext {
    // Field order is drop order: channels and dictionaries reference the
    // maps in `regions`, so `regions` stays last.
    control_channel: SharedChannel<ChannelWake>,
    feedback_channel: SharedChannel<ChannelWake>,
    global_dictionary: SharedConfigDictionary,
    config_dictionary: SharedConfigDictionary,
    control_event: Option<Arc<NamedSemaphore>>,
    feedback_event: Option<Arc<NamedSemaphore>>,
    fd_handout: Option<FdHandout>,
    config_region_created: bool,
    regions: Arc<RegionSet>,
}

impl MlosContext {
    // ── constructors ────────────────────────────────────────────────────

    /// Named shared memory + named semaphores (the default deployment).
    pub fn inter_process() -> Result<Self, Error> {
        Self::inter_process_with(InterProcessOptions::default())
    }

    pub fn inter_process_with(options: InterProcessOptions) -> Result<Self, Error> {
        let (global, global_disposition) =
            SharedMemoryMap::create_or_open(&options.global_memory_name, options.region_size)?;
        let (control, control_disposition) = SharedMemoryMap::create_or_open(
            &options.control_channel_name,
            channel_region_size(options.region_size),
        )?;
        let (feedback, feedback_disposition) = SharedMemoryMap::create_or_open(
            &options.feedback_channel_name,
            channel_region_size(options.region_size),
        )?;
        let (config, config_disposition) =
            SharedMemoryMap::create_or_open(&options.shared_config_name, options.region_size)?;

        let control_event = Arc::new(NamedSemaphore::create_or_open(&options.control_event_name)?);
        let feedback_event =
            Arc::new(NamedSemaphore::create_or_open(&options.feedback_event_name)?);

        let context = Self::assemble(
            Arc::new(RegionSet {
                global,
                control,
                feedback,
                config,
            }),
            [
                global_disposition,
                control_disposition,
                feedback_disposition,
                config_disposition,
            ],
            ChannelWake::semaphore(control_event.clone()),
            ChannelWake::semaphore(feedback_event.clone()),
            Some(control_event),
            Some(feedback_event),
        )?;

        context.register_named_objects(&options)?;
        context.announce_config_region();
        Ok(context)
    }

    /// Anonymous (`memfd`) regions plus descriptor exchange with the
    /// agent. The agent being down is fine: the watcher thread re-sends
    /// descriptors whenever it (re)appears.
    pub fn anonymous() -> Result<Self, Error> {
        Self::anonymous_with(AnonymousOptions::default())
    }

    pub fn anonymous_with(options: AnonymousOptions) -> Result<Self, Error> {
        let client = match FdExchangeClient::connect(&options.socket_path) {
            Ok(client) => Some(client),
            Err(err) => {
                tracing::debug!(%err, "agent unavailable; deferring descriptor exchange");
                None
            }
        };

        let (global, global_disposition) = Self::anonymous_region(
            client.as_ref(),
            GLOBAL_MEMORY_MAP_NAME,
            options.region_size,
        )?;
        let (control, control_disposition) = Self::anonymous_region(
            client.as_ref(),
            CONTROL_CHANNEL_MAP_NAME,
            channel_region_size(options.region_size),
        )?;
        let (feedback, feedback_disposition) = Self::anonymous_region(
            client.as_ref(),
            FEEDBACK_CHANNEL_MAP_NAME,
            channel_region_size(options.region_size),
        )?;
        let (config, config_disposition) = Self::anonymous_region(
            client.as_ref(),
            SHARED_CONFIG_MAP_NAME,
            options.region_size,
        )?;

        let control_event = Arc::new(NamedSemaphore::create_or_open(&options.control_event_name)?);
        let feedback_event =
            Arc::new(NamedSemaphore::create_or_open(&options.feedback_event_name)?);

        let mut context = Self::assemble(
            Arc::new(RegionSet {
                global,
                control,
                feedback,
                config,
            }),
            [
                global_disposition,
                control_disposition,
                feedback_disposition,
                config_disposition,
            ],
            ChannelWake::semaphore(control_event.clone()),
            ChannelWake::semaphore(feedback_event.clone()),
            Some(control_event),
            Some(feedback_event),
        )?;

        context.fd_handout = Some(Self::spawn_fd_handout(
            context.regions.clone(),
            options.socket_path.clone(),
            &options.watch_directory,
        )?);
        context.announce_config_region();
        Ok(context)
    }

    /// Private regions, spinning readers, no OS synchronization objects.
    pub fn internal() -> Result<Self, Error> {
        let global =
            SharedMemoryMap::create_anonymous(TEST_GLOBAL_MEMORY_MAP_NAME, DEFAULT_REGION_SIZE)?;
        let control = SharedMemoryMap::create_anonymous(
            "Test_Mlos.ControlChannel",
            channel_region_size(DEFAULT_REGION_SIZE),
        )?;
        let feedback = SharedMemoryMap::create_anonymous(
            "Test_Mlos.FeedbackChannel",
            channel_region_size(DEFAULT_REGION_SIZE),
        )?;
        let config = SharedMemoryMap::create_anonymous(
            "Test_Mlos.Config.SharedMemory",
            DEFAULT_REGION_SIZE,
        )?;

        Self::assemble(
            Arc::new(RegionSet {
                global,
                control,
                feedback,
                config,
            }),
            [CreateDisposition::CreatedNew; 4],
            ChannelWake::in_process(),
            ChannelWake::in_process(),
            None,
            None,
        )
    }

    fn anonymous_region(
        client: Option<&FdExchangeClient>,
        id: &str,
        size: usize,
    ) -> Result<(SharedMemoryMap, CreateDisposition), Error> {
        // If the agent survived a previous run of this target, adopt the
        // regions it still holds.
        if let Some(client) = client {
            match client.get_fd(id) {
                Ok(Some(fd)) => {
                    let map = SharedMemoryMap::open_from_descriptor(id, fd)?;
                    return Ok((map, CreateDisposition::OpenedExisting));
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(id, %err, "descriptor query failed; creating region locally")
                }
            }
        }

        let map = SharedMemoryMap::create_anonymous(id, size)?;
        if let Some(client) = client {
            if let Err(err) = client.send_fd(id, map.as_raw_fd()) {
                tracing::warn!(id, %err, "failed to send region descriptor");
            }
        }
        Ok((map, CreateDisposition::CreatedNew))
    }

    fn assemble(
        regions: Arc<RegionSet>,
        dispositions: [CreateDisposition; 4],
        control_wake: ChannelWake,
        feedback_wake: ChannelWake,
        control_event: Option<Arc<NamedSemaphore>>,
        feedback_event: Option<Arc<NamedSemaphore>>,
    ) -> Result<Self, Error> {
        let [global_disposition, control_disposition, feedback_disposition, config_disposition] =
            dispositions;

        let global_dictionary = setup_global_region(&regions.global, global_disposition)?;
        let control_ring =
            setup_channel_region(&regions.control, RegionType::ControlChannel, control_disposition)?;
        let feedback_ring = setup_channel_region(
            &regions.feedback,
            RegionType::FeedbackChannel,
            feedback_disposition,
        )?;
        let config_dictionary =
            setup_shared_config_region(&regions.config, config_disposition)?;

        let global = unsafe { global_memory_region(regions.global.region()) };
        for disposition in [control_disposition, feedback_disposition, config_disposition] {
            if disposition == CreateDisposition::CreatedNew {
                global.total_region_count.fetch_add(1, Ordering::AcqRel);
            }
        }

        // Channel construction runs restart recovery on whatever state
        // the previous owner left behind.
        let control_channel = unsafe {
            SharedChannel::new(&global.control_channel_sync, control_ring, control_wake)
        };
        let feedback_channel = unsafe {
            SharedChannel::new(&global.feedback_channel_sync, feedback_ring, feedback_wake)
        };

        global.attached_process_count.fetch_add(1, Ordering::AcqRel);

        Ok(Self {
            control_channel,
            feedback_channel,
            global_dictionary,
            config_dictionary,
            control_event,
            feedback_event,
            fd_handout: None,
            config_region_created: config_disposition == CreateDisposition::CreatedNew,
            regions,
        })
    }

    fn spawn_fd_handout(
        regions: Arc<RegionSet>,
        socket_path: PathBuf,
        watch_directory: &std::path::Path,
    ) -> Result<FdHandout, Error> {
        let watch = Arc::new(WatchFile::new(watch_directory, WATCH_FILE_NAME)?);

        let handle = {
            let watch = watch.clone();
            std::thread::spawn(move || {
                loop {
                    if watch.wait().is_err() {
                        // Aborted (context shutdown) or inotify failure.
                        return;
                    }

                    match FdExchangeClient::connect(&socket_path) {
                        Ok(client) => {
                            for (id, fd) in regions.descriptors() {
                                if let Err(err) = client.send_fd(id, fd) {
                                    tracing::warn!(id, %err, "descriptor resend failed");
                                }
                            }
                            tracing::debug!("sent region descriptors to agent");
                        }
                        Err(err) => {
                            tracing::warn!(%err, "agent opened watch file but socket connect failed");
                        }
                    }
                }
            })
        };

        Ok(FdHandout {
            watch,
            handle: Some(handle),
        })
    }

    // ── registration ────────────────────────────────────────────────────

    /// Publish the shm and event names in the global directory so the
    /// agent can find them.
    fn register_named_objects(&self, options: &InterProcessOptions) -> Result<(), Error> {
        let entries = [
            (RegionType::Global, 0, &options.global_memory_name),
            (RegionType::ControlChannel, 0, &options.control_channel_name),
            (RegionType::FeedbackChannel, 0, &options.feedback_channel_name),
            (
                RegionType::SharedConfig,
                SHARED_CONFIG_REGION_INDEX,
                &options.shared_config_name,
            ),
        ];
        for (region_type, index, name) in entries {
            let mut config = ComponentConfig::new(RegisteredMemoryRegionConfig {
                region_id: MemoryRegionId::new(region_type, index),
                shared_memory_map_name: name.clone(),
            });
            self.global_dictionary.create_or_update(&mut config)?;
        }

        let events = [
            (RegionType::ControlChannel, &options.control_event_name),
            (RegionType::FeedbackChannel, &options.feedback_event_name),
        ];
        for (region_type, name) in events {
            let mut config = ComponentConfig::new(RegisteredNamedEventConfig {
                region_id: MemoryRegionId::new(region_type, 0),
                event_name: name.clone(),
            });
            self.global_dictionary.create_or_update(&mut config)?;
        }
        Ok(())
    }

    /// Tell the agent where the shared-config region is.
    fn announce_config_region(&self) {
        if self.config_region_created {
            self.send_control_message(&RegisterSharedConfigMemoryRegionRequest {
                region_id: MemoryRegionId::new(
                    RegionType::SharedConfig,
                    SHARED_CONFIG_REGION_INDEX,
                ),
            });
        }
    }

    /// Register a settings assembly and tell the agent to load it.
    ///
    /// Idempotent: an assembly already present in the directory (e.g.
    /// after a target restart against a surviving agent) is adopted.
    pub fn register_settings_assembly(
        &self,
        assembly_file_name: &str,
        dispatch_table_base_index: u32,
    ) -> Result<u32, Error> {
        let global = self.global();
        let assembly_index = global
            .registered_settings_assembly_count
            .load(Ordering::Acquire);

        let mut config = ComponentConfig::new(RegisteredSettingsAssemblyConfig {
            assembly_index,
            dispatch_table_base_index,
            assembly_file_name: assembly_file_name.to_string(),
        });

        match self.global_dictionary.lookup(&mut config) {
            Ok(()) => return Ok(config.local().assembly_index),
            Err(Error::NotFound) => {}
            Err(err) => return Err(err),
        }

        self.global_dictionary.create_or_update(&mut config)?;
        global
            .registered_settings_assembly_count
            .fetch_add(1, Ordering::AcqRel);

        self.send_control_message(&RegisterSettingsAssemblyRequest { assembly_index });
        tracing::info!(assembly_index, assembly_file_name, "registered settings assembly");
        Ok(assembly_index)
    }

    /// Register a component config, binding it to the shared record.
    pub fn register_component_config<T: ConfigRecord>(
        &self,
        config: &mut ComponentConfig<T>,
    ) -> Result<ConfigDisposition, Error> {
        self.config_dictionary.create_or_update(config)
    }

    // ── accessors ───────────────────────────────────────────────────────

    pub fn control_channel(&self) -> &SharedChannel<ChannelWake> {
        &self.control_channel
    }

    pub fn feedback_channel(&self) -> &SharedChannel<ChannelWake> {
        &self.feedback_channel
    }

    pub fn global_dictionary(&self) -> &SharedConfigDictionary {
        &self.global_dictionary
    }

    pub fn config_dictionary(&self) -> &SharedConfigDictionary {
        &self.config_dictionary
    }

    fn global(&self) -> &GlobalMemoryRegion {
        unsafe { global_memory_region(self.regions.global.region()) }
    }

    pub fn is_control_channel_active(&self) -> bool {
        !self.control_channel.sync().is_terminated()
    }

    pub fn is_feedback_channel_active(&self) -> bool {
        !self.feedback_channel.sync().is_terminated()
    }

    // ── sending ─────────────────────────────────────────────────────────

    pub fn send_control_message<M: ShmMessage>(&self, msg: &M) -> SendStatus {
        self.control_channel.send_message(msg)
    }

    /// Telemetry shares the control channel.
    pub fn send_telemetry_message<M: ShmMessage>(&self, msg: &M) -> SendStatus {
        self.control_channel.send_message(msg)
    }

    pub fn send_feedback_message<M: ShmMessage>(&self, msg: &M) -> SendStatus {
        self.feedback_channel.send_message(msg)
    }

    // ── termination ─────────────────────────────────────────────────────

    /// Stop the control channel. The terminate message wakes any agent
    /// reader blocked on the semaphore so it can observe the flag.
    pub fn terminate_control_channel(&self) {
        self.control_channel.sync().terminate();
        self.control_channel
            .send_message(&TerminateReaderThreadRequest);
    }

    /// Stop the feedback channel and wait until every reader thread has
    /// observed the flag and exited.
    pub fn terminate_feedback_channel(&self) {
        let sync = self.feedback_channel.sync();
        sync.terminate();
        self.feedback_channel
            .send_message(&TerminateReaderThreadRequest);

        while sync.active_reader_count.load(Ordering::Acquire) != 0 {
            // One signal per loop so every blocked waiter gets released.
            self.feedback_channel.policy().notify_reader();
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for MlosContext {
    fn drop(&mut self) {
        if let Some(mut handout) = self.fd_handout.take() {
            handout.watch.abort();
            if let Some(handle) = handout.handle.take() {
                let _ = handle.join();
            }
        }

        let remaining = self
            .global()
            .attached_process_count
            .fetch_sub(1, Ordering::AcqRel);
        if remaining == 1 {
            // Last process out unlinks the OS objects.
            self.regions.global.set_cleanup_on_close(true);
            self.regions.control.set_cleanup_on_close(true);
            self.regions.feedback.set_cleanup_on_close(true);
            self.regions.config.set_cleanup_on_close(true);
            if let Some(event) = &self.control_event {
                event.set_cleanup_on_close(true);
            }
            if let Some(event) = &self.feedback_event {
                event.set_cleanup_on_close(true);
            }
            tracing::debug!("last detacher; cleaning up shared objects");
        }
    }
}
