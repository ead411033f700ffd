//! The explicit engine handle.
//!
//! The engine owns the Vulkan instance, the logical device and everything
//! shared between loops and views: the allocator, the queue pool and the
//! worker threads. Nothing is global; frame loops and views are built from
//! an engine and borrow its shared state through `Arc`s.

use {
    crate::{
        device::{Device, DeviceFeatures},
        frame::{Loop, LoopInfo, WorkerPool},
        memory::{
            Allocator, AllocatorLimits, DeviceBackend, MemoryBackend,
            MemoryProperties, TraceBackend,
        },
        queue::{QueueFamilyInfo, QueueOperations, QueuePool},
        EngineOptions, RenderError,
    },
    anyhow::{anyhow, Context},
    ash::vk,
    indoc::indoc,
    std::{
        ffi::{c_void, CStr},
        mem::ManuallyDrop,
        sync::Arc,
    },
};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// What device selection needs to know about one physical device.
#[derive(Debug, Clone, Default)]
pub struct DeviceCandidate {
    pub index: usize,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub extensions: Vec<String>,

    /// (queue flags, queue count, can present) for every family.
    pub queue_families: Vec<(vk::QueueFlags, u32, bool)>,

    pub partially_bound: bool,
    pub update_after_bind: bool,
}

impl DeviceCandidate {
    pub fn has_extension(&self, name: &CStr) -> bool {
        let name = name.to_string_lossy();
        self.extensions.iter().any(|extension| *extension == name)
    }

    fn can_render(&self) -> bool {
        self.queue_families
            .iter()
            .any(|(flags, count, _)| {
                *count > 0 && flags.contains(vk::QueueFlags::GRAPHICS)
            })
    }

    fn type_rank(&self) -> u32 {
        match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 0,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
            _ => 3,
        }
    }
}

/// The chosen physical device and what gets enabled on it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceSelection {
    pub index: usize,
    pub features: DeviceFeatures,
    pub extensions: Vec<&'static CStr>,
}

/// Pick the physical device to render with.
///
/// Devices without VK_KHR_swapchain or a graphics queue are never picked.
/// An explicit `device_index` wins, otherwise discrete GPUs are preferred
/// over integrated and virtual ones. Memory budget and descriptor indexing
/// are enabled when the device has them.
pub fn select_physical_device(
    candidates: &[DeviceCandidate],
    options: &EngineOptions,
) -> Result<DeviceSelection, RenderError> {
    let swapchain = ash::khr::swapchain::NAME;
    let candidate = match options.device_index {
        Some(index) => {
            let candidate = candidates
                .iter()
                .find(|candidate| candidate.index == index)
                .with_context(|| {
                    format!(
                        "Device index {} is out of range, {} devices found",
                        index,
                        candidates.len()
                    )
                })?;
            if !candidate.has_extension(swapchain) {
                return Err(RenderError::ExtensionMissing(
                    swapchain.to_string_lossy().into_owned(),
                ));
            }
            candidate
        }
        None => {
            let usable = candidates
                .iter()
                .filter(|candidate| candidate.can_render())
                .collect::<Vec<_>>();
            if usable.is_empty() {
                return Err(anyhow!("No physical device can render").into());
            }
            usable
                .into_iter()
                .filter(|candidate| candidate.has_extension(swapchain))
                .min_by_key(|candidate| {
                    (candidate.type_rank(), candidate.index)
                })
                .ok_or_else(|| {
                    RenderError::ExtensionMissing(
                        swapchain.to_string_lossy().into_owned(),
                    )
                })?
        }
    };

    let mut extensions = vec![swapchain];
    let memory_budget = candidate.has_extension(ash::ext::memory_budget::NAME);
    if memory_budget {
        extensions.push(ash::ext::memory_budget::NAME);
    }
    let descriptor_indexing =
        candidate.has_extension(ash::ext::descriptor_indexing::NAME);
    if descriptor_indexing {
        extensions.push(ash::ext::descriptor_indexing::NAME);
    }

    Ok(DeviceSelection {
        index: candidate.index,
        features: DeviceFeatures {
            memory_budget,
            descriptor_indexing,
            descriptor_binding_partially_bound: descriptor_indexing
                && candidate.partially_bound,
            update_after_bind: descriptor_indexing
                && candidate.update_after_bind,
        },
        extensions,
    })
}

/// Decides whether a queue family of a physical device can present to the
/// host's surface.
pub type PresentSupport<'a> = &'a dyn Fn(vk::PhysicalDevice, u32) -> bool;

type DebugMessenger =
    (ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT);

/// The instance, device and shared state every loop and view renders with.
pub struct Engine {
    options: EngineOptions,
    entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
    raw_device: ash::Device,
    device: ManuallyDrop<Arc<Device>>,
    queues: Arc<QueuePool>,
    workers: ManuallyDrop<Arc<WorkerPool>>,
}

// Public API
// ----------

impl Engine {
    /// Create the instance and the logical device.
    ///
    /// # Params
    ///
    /// * `options` - the host's choices for device, validation and modes
    /// * `instance_extensions` - the surface extensions the host needs
    /// * `present_support` - whether a queue family can present
    pub fn new(
        options: EngineOptions,
        instance_extensions: &[&CStr],
        present_support: PresentSupport,
    ) -> Result<Self, RenderError> {
        let entry = unsafe { ash::Entry::load() }
            .context("Unable to load the Vulkan library")?;
        let (instance, debug) =
            unsafe { create_instance(&entry, &options, instance_extensions)? };

        let created =
            unsafe { create_device(&instance, &options, present_support) };
        let (physical_device, raw_device, selection, families) = match created
        {
            Ok(created) => created,
            Err(err) => {
                unsafe { destroy_instance(&instance, debug) };
                return Err(err);
            }
        };
        let queues = Arc::new(QueuePool::new(families));
        let device = Arc::new(unsafe {
            wrap_device(
                &instance,
                physical_device,
                &raw_device,
                selection.features,
                &options,
            )
        });
        device.update_budget();

        let graphics_queues = queues.queue_count(QueueOperations::GRAPHICS);
        let worker_count = options.resolve_worker_count(graphics_queues);
        let workers = match WorkerPool::new(worker_count, "render") {
            Ok(workers) => Arc::new(workers),
            Err(err) => {
                drop(device);
                unsafe {
                    raw_device.destroy_device(None);
                    destroy_instance(&instance, debug);
                }
                return Err(err);
            }
        };

        let engine = Self {
            options,
            entry,
            instance,
            debug,
            raw_device,
            device: ManuallyDrop::new(device),
            queues,
            workers: ManuallyDrop::new(workers),
        };
        log::info!("{}", engine);
        Ok(engine)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn queues(&self) -> &Arc<QueuePool> {
        &self.queues
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        self.device.allocator()
    }

    /// A surface loader for the host's surfaces.
    pub fn surface_loader(&self) -> ash::khr::surface::Instance {
        ash::khr::surface::Instance::new(&self.entry, &self.instance)
    }

    /// Build a frame loop sharing this engine's device, queues and workers.
    pub fn create_loop(&self) -> Loop {
        Loop::new(LoopInfo {
            fence_device: Arc::new(self.raw_device.clone()),
            queues: self.queues.clone(),
            workers: Arc::clone(&self.workers),
            descriptor_sink: Arc::new(self.raw_device.clone()),
            allocator: Some(self.allocator().clone()),
            device: Some(Arc::clone(&self.device)),
            update_interval: self.options.update_interval,
            frame_emitter_barrier: self.options.enable_frame_emitter_barrier,
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.raw_device.device_wait_idle() {
                log::error!("Unable to idle the device: {}", err);
            }
            for pool in self.queues.drain_command_pools() {
                pool.destroy(&self.raw_device);
            }
            drop(ManuallyDrop::take(&mut self.workers));

            let device = ManuallyDrop::take(&mut self.device);
            if Arc::strong_count(&device) > 1 {
                log::warn!(
                    "{} device references outlive the engine",
                    Arc::strong_count(&device) - 1
                );
            }
            drop(device);

            self.raw_device.destroy_device(None);
            destroy_instance(&self.instance, self.debug.take());
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let properties = unsafe {
            self.instance
                .get_physical_device_properties(self.device.physical_device())
        };
        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        f.write_fmt(format_args!(
            indoc!(
                "
                Engine

                Device: {} ({:?})
                Features: {:?}
                Workers: {}
                Render mode: {:?}"
            ),
            name,
            properties.device_type,
            self.device.features(),
            self.workers.worker_count(),
            self.options.render_mode,
        ))
    }
}

// Private API
// -----------

/// Pick a physical device and create the logical device with every queue of
/// every family.
unsafe fn create_device(
    instance: &ash::Instance,
    options: &EngineOptions,
    present_support: PresentSupport,
) -> Result<
    (vk::PhysicalDevice, ash::Device, DeviceSelection, Vec<QueueFamilyInfo>),
    RenderError,
> {
    let physical_devices = instance
        .enumerate_physical_devices()
        .context("Unable to enumerate physical devices")?;
    let candidates = physical_devices
        .iter()
        .enumerate()
        .map(|(index, &physical_device)| {
            describe_candidate(
                instance,
                index,
                physical_device,
                present_support,
            )
        })
        .collect::<Result<Vec<_>, RenderError>>()?;
    let selection = select_physical_device(&candidates, options)?;
    let candidate = &candidates[selection.index];
    let physical_device = physical_devices[selection.index];
    log::info!(
        "Using {} ({:?}) with {:?}",
        candidate.name,
        candidate.device_type,
        selection.features
    );

    let priorities = candidate
        .queue_families
        .iter()
        .map(|(_, count, _)| vec![1.0_f32; *count as usize])
        .collect::<Vec<_>>();
    let queue_infos = priorities
        .iter()
        .enumerate()
        .filter(|(_, priorities)| !priorities.is_empty())
        .map(|(family, priorities)| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family as u32)
                .queue_priorities(priorities)
        })
        .collect::<Vec<_>>();
    let extensions = selection
        .extensions
        .iter()
        .map(|name| name.as_ptr())
        .collect::<Vec<_>>();

    let mut indexing = vk::PhysicalDeviceDescriptorIndexingFeatures::default()
        .descriptor_binding_partially_bound(
            selection.features.descriptor_binding_partially_bound,
        )
        .descriptor_binding_sampled_image_update_after_bind(
            selection.features.update_after_bind,
        )
        .descriptor_binding_storage_buffer_update_after_bind(
            selection.features.update_after_bind,
        )
        .descriptor_binding_uniform_buffer_update_after_bind(
            selection.features.update_after_bind,
        );
    let mut create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions);
    if selection.features.descriptor_indexing {
        create_info = create_info.push_next(&mut indexing);
    }
    let raw_device = instance
        .create_device(physical_device, &create_info, None)
        .context("Unable to create the logical device")?;

    let families = candidate
        .queue_families
        .iter()
        .enumerate()
        .filter(|(_, (_, count, _))| *count > 0)
        .map(|(family, (flags, count, present))| QueueFamilyInfo {
            index: family as u32,
            ops: QueueOperations::from_family(*flags, *present),
            queues: (0..*count)
                .map(|queue| raw_device.get_device_queue(family as u32, queue))
                .collect(),
        })
        .collect();
    Ok((physical_device, raw_device, selection, families))
}

/// Build the allocator and the device wrapper. Validation wraps the memory
/// backend in a trace which reports leaks when the allocator drops.
unsafe fn wrap_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    raw_device: &ash::Device,
    features: DeviceFeatures,
    options: &EngineOptions,
) -> Device {
    let properties = MemoryProperties::new(instance, physical_device);
    let limits = instance
        .get_physical_device_properties(physical_device)
        .limits;
    let device_backend = DeviceBackend::new(raw_device.clone());
    let backend: Box<dyn MemoryBackend + Send> = if options.validation {
        Box::new(TraceBackend::new(
            properties.clone(),
            device_backend,
            "Engine",
        ))
    } else {
        Box::new(device_backend)
    };
    let allocator = Arc::new(Allocator::new(
        properties,
        AllocatorLimits::from_properties(&limits),
        options.persistent_mapping,
        backend,
    ));
    Device::new(
        instance.clone(),
        physical_device,
        raw_device.clone(),
        features,
        allocator,
        options.frame_cache_capacity,
    )
}

unsafe fn create_instance(
    entry: &ash::Entry,
    options: &EngineOptions,
    instance_extensions: &[&CStr],
) -> Result<(ash::Instance, Option<DebugMessenger>), RenderError> {
    let validation = options.validation && {
        let layers = entry
            .enumerate_instance_layer_properties()
            .context("Unable to list instance layers")?;
        let found = layers.iter().any(|layer| {
            layer
                .layer_name_as_c_str()
                .is_ok_and(|name| name == VALIDATION_LAYER)
        });
        if !found {
            log::warn!("Validation layer is not available!");
        }
        found
    };

    let mut extensions = instance_extensions
        .iter()
        .map(|name| name.as_ptr())
        .collect::<Vec<_>>();
    let mut layers = Vec::new();
    if validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        layers.push(VALIDATION_LAYER.as_ptr());
    }

    let app_info = vk::ApplicationInfo::default()
        .engine_name(c"ccthw_render_core")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_2);
    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);
    let instance = entry
        .create_instance(&create_info, None)
        .context("Unable to create the Vulkan instance")?;

    if !validation {
        return Ok((instance, None));
    }
    let debug_utils = ash::ext::debug_utils::Instance::new(entry, &instance);
    let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));
    match debug_utils.create_debug_utils_messenger(&messenger_info, None) {
        Ok(messenger) => Ok((instance, Some((debug_utils, messenger)))),
        Err(err) => {
            instance.destroy_instance(None);
            Err(err.into())
        }
    }
}

unsafe fn destroy_instance(
    instance: &ash::Instance,
    debug: Option<DebugMessenger>,
) {
    if let Some((debug_utils, messenger)) = debug {
        debug_utils.destroy_debug_utils_messenger(messenger, None);
    }
    instance.destroy_instance(None);
}

unsafe fn describe_candidate(
    instance: &ash::Instance,
    index: usize,
    physical_device: vk::PhysicalDevice,
    present_support: PresentSupport,
) -> Result<DeviceCandidate, RenderError> {
    let properties = instance.get_physical_device_properties(physical_device);
    let extensions = instance
        .enumerate_device_extension_properties(physical_device)
        .context("Unable to list device extensions")?
        .iter()
        .filter_map(|extension| extension.extension_name_as_c_str().ok())
        .map(|name| name.to_string_lossy().into_owned())
        .collect();
    let queue_families = instance
        .get_physical_device_queue_family_properties(physical_device)
        .iter()
        .enumerate()
        .map(|(family, family_properties)| {
            (
                family_properties.queue_flags,
                family_properties.queue_count,
                present_support(physical_device, family as u32),
            )
        })
        .collect();

    let mut indexing = vk::PhysicalDeviceDescriptorIndexingFeatures::default();
    let mut features =
        vk::PhysicalDeviceFeatures2::default().push_next(&mut indexing);
    instance.get_physical_device_features2(physical_device, &mut features);

    Ok(DeviceCandidate {
        index,
        name: properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        device_type: properties.device_type,
        extensions,
        queue_families,
        partially_bound: indexing.descriptor_binding_partially_bound
            == vk::TRUE,
        update_after_bind: indexing
            .descriptor_binding_sampled_image_update_after_bind
            == vk::TRUE,
    })
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("{:?} {}", message_type, message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("{:?} {}", message_type, message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::debug!("{:?} {}", message_type, message)
        }
        _ => log::trace!("{:?} {}", message_type, message),
    }
    vk::FALSE
}

#[cfg(test)]
mod test {
    use {super::*, pretty_assertions::assert_eq};

    fn candidate(
        index: usize,
        device_type: vk::PhysicalDeviceType,
        extensions: &[&CStr],
    ) -> DeviceCandidate {
        DeviceCandidate {
            index,
            name: format!("gpu {}", index),
            device_type,
            extensions: extensions
                .iter()
                .map(|name| name.to_string_lossy().into_owned())
                .collect(),
            queue_families: vec![(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                2,
                true,
            )],
            partially_bound: true,
            update_after_bind: true,
        }
    }

    #[test]
    fn prefers_discrete_devices() {
        let swapchain = ash::khr::swapchain::NAME;
        let candidates = [
            candidate(0, vk::PhysicalDeviceType::INTEGRATED_GPU, &[swapchain]),
            candidate(1, vk::PhysicalDeviceType::DISCRETE_GPU, &[swapchain]),
            candidate(2, vk::PhysicalDeviceType::DISCRETE_GPU, &[]),
        ];
        let selection =
            select_physical_device(&candidates, &EngineOptions::default())
                .unwrap();
        assert_eq!(selection.index, 1);
        assert_eq!(selection.extensions, vec![swapchain]);
        assert_eq!(selection.features, DeviceFeatures::default());
    }

    #[test]
    fn explicit_index_wins() {
        let swapchain = ash::khr::swapchain::NAME;
        let candidates = [
            candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU, &[swapchain]),
            candidate(1, vk::PhysicalDeviceType::CPU, &[swapchain]),
        ];
        let options = EngineOptions {
            device_index: Some(1),
            ..EngineOptions::default()
        };
        let selected = select_physical_device(&candidates, &options).unwrap();
        assert_eq!(selected.index, 1);

        let options = EngineOptions {
            device_index: Some(7),
            ..EngineOptions::default()
        };
        assert!(select_physical_device(&candidates, &options).is_err());
    }

    #[test]
    fn missing_swapchain_extension() {
        let candidates =
            [candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU, &[])];
        let err = select_physical_device(&candidates, &EngineOptions::default())
            .unwrap_err();
        assert!(matches!(err, RenderError::ExtensionMissing(name)
            if name == "VK_KHR_swapchain"));
    }

    #[test]
    fn optional_extensions_become_features() {
        let candidates = [candidate(
            0,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            &[
                ash::ext::descriptor_indexing::NAME,
                ash::khr::swapchain::NAME,
                ash::ext::memory_budget::NAME,
            ],
        )];
        let selection =
            select_physical_device(&candidates, &EngineOptions::default())
                .unwrap();
        assert_eq!(
            selection.features,
            DeviceFeatures {
                memory_budget: true,
                descriptor_indexing: true,
                descriptor_binding_partially_bound: true,
                update_after_bind: true,
            }
        );
        assert_eq!(selection.extensions.len(), 3);
    }

    #[test]
    fn devices_without_graphics_queues_are_skipped() {
        let swapchain = ash::khr::swapchain::NAME;
        let mut compute_only =
            candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU, &[swapchain]);
        compute_only.queue_families = vec![(vk::QueueFlags::COMPUTE, 1, false)];
        let candidates = [
            compute_only,
            candidate(1, vk::PhysicalDeviceType::VIRTUAL_GPU, &[swapchain]),
        ];
        let selection =
            select_physical_device(&candidates, &EngineOptions::default())
                .unwrap();
        assert_eq!(selection.index, 1);
    }
}
