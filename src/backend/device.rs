// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Window surface creation
// - Physical device selection (first device that can render and present)
// - Logical device + graphics/present queue creation

use anyhow::{Context, Result};
use ash::{vk, Entry};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::collections::BTreeSet;
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use super::surface::{self, Surface};
use super::tracker::{ResourceKind, ResourceTracker};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Device extensions every candidate GPU must expose
pub fn required_device_extensions() -> [&'static CStr; 1] {
    [ash::extensions::khr::Swapchain::name()]
}

/// Queue families a device offers for our two kinds of work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Search the families of one device.
    ///
    /// A family doing both graphics and present wins; otherwise the first
    /// graphics family and the first present family are used.
    pub fn find<F>(families: &[vk::QueueFamilyProperties], mut supports_present: F) -> Result<Self>
    where
        F: FnMut(u32) -> Result<bool>,
    {
        let mut indices = Self::default();

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            let graphics = family.queue_count > 0
                && family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let present = supports_present(index)?;

            if graphics && present {
                return Ok(Self {
                    graphics: Some(index),
                    present: Some(index),
                });
            }
            if graphics && indices.graphics.is_none() {
                indices.graphics = Some(index);
            }
            if present && indices.present.is_none() {
                indices.present = Some(index);
            }
        }

        Ok(indices)
    }

    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Both kinds of work go through the same family
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, one queue gets created per entry
    pub fn unique(&self) -> Vec<u32> {
        [self.graphics, self.present]
            .into_iter()
            .flatten()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Everything the selector needs to know about one physical device
#[derive(Debug, Clone, Default)]
pub struct DeviceCandidate {
    pub name: String,
    pub queue_families: QueueFamilyIndices,
    pub missing_extensions: Vec<String>,
    pub surface_format_count: usize,
    pub present_mode_count: usize,
}

impl DeviceCandidate {
    pub fn is_suitable(&self) -> bool {
        self.queue_families.is_complete()
            && self.missing_extensions.is_empty()
            && self.surface_format_count > 0
            && self.present_mode_count > 0
    }
}

/// Names from `required` that `available` does not list
pub fn missing_extensions(available: &[vk::ExtensionProperties], required: &[&CStr]) -> Vec<String> {
    let available: BTreeSet<&CStr> = available
        .iter()
        .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
        .collect();

    required
        .iter()
        .filter(|name| !available.contains(**name))
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

/// First suitable candidate, in enumeration order
pub fn select_device<T>(candidates: impl IntoIterator<Item = (T, DeviceCandidate)>) -> Option<(T, DeviceCandidate)> {
    candidates.into_iter().find(|(_, candidate)| {
        if !candidate.is_suitable() {
            log::debug!("Skipping unsuitable GPU {}: {:?}", candidate.name, candidate);
        }
        candidate.is_suitable()
    })
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface: Surface,
    pub instance: ash::Instance,
    pub entry: Entry,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilyIndices,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub properties: vk::PhysicalDeviceProperties,
    pub tracker: ResourceTracker,
}

impl VulkanDevice {
    /// Create instance, surface and device for a window
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    /// * `window` - Native window the surface is created for
    pub fn new<W>(app_name: &str, enable_validation: bool, window: &W) -> Result<Arc<Self>>
    where
        W: HasWindowHandle + HasDisplayHandle + ?Sized,
    {
        log::info!("Creating Vulkan device: {}", app_name);
        let tracker = ResourceTracker::new();

        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        if enable_validation && !Self::validation_layer_supported(&entry)? {
            anyhow::bail!(
                "Validation layer {:?} requested but not available; install the Vulkan SDK or disable debug.validation_layers",
                VALIDATION_LAYER
            );
        }

        // Step 2: Create instance
        let extensions = surface::required_extensions(display_handle)?;
        let instance = Self::create_instance(&entry, app_name, &extensions, enable_validation)?;

        // Until the device exists, a failure releases everything made so far
        let mut build = PartialBuild::new(tracker);
        let instance_handle = instance.clone();
        build.track(None, move || unsafe { instance_handle.destroy_instance(None) });

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            let (loader, messenger) = Self::setup_debug_messenger(&entry, &instance)?;
            let undo_loader = loader.clone();
            build.track(Some(ResourceKind::DebugMessenger), move || unsafe {
                undo_loader.destroy_debug_utils_messenger(messenger, None)
            });
            Some((loader, messenger))
        } else {
            None
        };

        // Step 4: Surface
        let surface = unsafe { Surface::new(&entry, &instance, display_handle, window_handle)? };
        let (surface_loader, surface_handle) = (surface.loader.clone(), surface.handle);
        build.track(Some(ResourceKind::Surface), move || unsafe {
            surface_loader.destroy_surface(surface_handle, None)
        });

        // Step 5: Pick physical device (GPU)
        let (physical_device, queue_families) = Self::pick_physical_device(&instance, &surface)?;

        // Step 6: Create logical device
        let (device, graphics_queue, present_queue) =
            Self::create_logical_device(&instance, physical_device, &queue_families)?;
        let tracker = build.finish();

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics {:?}, present {:?}",
            queue_families.graphics,
            queue_families.present
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            surface,
            instance,
            entry,
            graphics_queue,
            present_queue,
            queue_families,
            debug_utils,
            properties,
            tracker,
        }))
    }

    fn validation_layer_supported(entry: &Entry) -> Result<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?;

        Ok(layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        surface_extensions: &[*const c_char],
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("Rocket Engine")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions = surface_extensions.to_vec();
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        // Chained so instance creation/destruction itself gets validated
        let mut debug_info = debug_messenger_info();

        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);
        if enable_validation {
            create_info = create_info.push_next(&mut debug_info);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let messenger = unsafe {
            debug_utils.create_debug_utils_messenger(&debug_messenger_info(), None)
        }
        .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface: &Surface,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let candidates = devices
            .into_iter()
            .map(|device| Ok((device, Self::describe_device(instance, surface, device)?)))
            .collect::<Result<Vec<_>>>()?;

        let (device, candidate) = select_device(candidates)
            .context("No GPU supports graphics, presentation and VK_KHR_swapchain for this surface")?;

        let queue_families = candidate.queue_families;
        Ok((device, queue_families))
    }

    fn describe_device(
        instance: &ash::Instance,
        surface: &Surface,
        device: vk::PhysicalDevice,
    ) -> Result<DeviceCandidate> {
        let props = unsafe { instance.get_physical_device_properties(device) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let queue_families =
            QueueFamilyIndices::find(&families, |index| surface.supports_present(device, index))?;

        let available = unsafe { instance.enumerate_device_extension_properties(device) }
            .context("Failed to enumerate device extensions")?;
        let missing_extensions = missing_extensions(&available, &required_device_extensions());

        // Only worth asking the surface once the swapchain extension exists
        let (surface_format_count, present_mode_count) = if missing_extensions.is_empty() {
            (
                surface.formats(device)?.len(),
                surface.present_modes(device)?.len(),
            )
        } else {
            (0, 0)
        };

        Ok(DeviceCandidate {
            name,
            queue_families,
            missing_extensions,
            surface_format_count,
            present_mode_count,
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilyIndices,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
        let graphics_family = queue_families.graphics.context("No graphics queue family")?;
        let present_family = queue_families.present.context("No present queue family")?;

        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<_> = required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }
}

/// Undo list for a device that is still being built.
///
/// Dropping it runs the undo steps newest first and reports leaks;
/// `finish` disarms it and hands the tracker over.
struct PartialBuild {
    tracker: ResourceTracker,
    undo: Vec<(Option<ResourceKind>, Box<dyn FnOnce()>)>,
}

impl PartialBuild {
    fn new(tracker: ResourceTracker) -> Self {
        Self {
            tracker,
            undo: Vec::new(),
        }
    }

    /// Record a created handle and how to destroy it
    fn track(&mut self, kind: Option<ResourceKind>, undo: impl FnOnce() + 'static) {
        if let Some(kind) = kind {
            self.tracker.created(kind);
        }
        self.undo.push((kind, Box::new(undo)));
    }

    fn finish(mut self) -> ResourceTracker {
        self.undo.clear();
        std::mem::take(&mut self.tracker)
    }
}

impl Drop for PartialBuild {
    fn drop(&mut self) {
        if self.undo.is_empty() {
            return;
        }
        log::warn!("Device creation failed, releasing {} handles", self.undo.len());
        while let Some((kind, undo)) = self.undo.pop() {
            undo();
            if let Some(kind) = kind {
                self.tracker.destroyed(kind);
            }
        }
        self.tracker.report_leaks();
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_device(None);

            self.surface.destroy();
            self.tracker.destroyed(ResourceKind::Surface);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
                self.tracker.destroyed(ResourceKind::DebugMessenger);
            }

            self.instance.destroy_instance(None);
        }

        if self.tracker.report_leaks() == 0 {
            log::info!("All GPU handles released");
        }
    }
}

fn debug_messenger_info() -> vk::DebugUtilsMessengerCreateInfoEXT {
    vk::DebugUtilsMessengerCreateInfoEXT::builder()
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
        .pfn_user_callback(Some(debug_callback))
        .build()
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::trace!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn extension(name: &CStr) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (dst, &src) in props.extension_name.iter_mut().zip(name.to_bytes()) {
            *dst = src as c_char;
        }
        props
    }

    fn suitable(name: &str) -> DeviceCandidate {
        DeviceCandidate {
            name: name.to_string(),
            queue_families: QueueFamilyIndices {
                graphics: Some(0),
                present: Some(0),
            },
            missing_extensions: vec![],
            surface_format_count: 2,
            present_mode_count: 1,
        }
    }

    #[test]
    fn prefers_family_doing_both() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
        ];
        let indices = QueueFamilyIndices::find(&families, |i| Ok(i != 0)).unwrap();

        assert_eq!(indices.graphics, Some(2));
        assert_eq!(indices.present, Some(2));
        assert!(indices.is_shared());
        assert_eq!(indices.unique(), vec![2]);
    }

    #[test]
    fn splits_families_when_no_single_one_fits() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let indices = QueueFamilyIndices::find(&families, |i| Ok(i == 1)).unwrap();

        assert!(indices.is_complete());
        assert!(!indices.is_shared());
        assert_eq!(indices.unique(), vec![0, 1]);
    }

    #[test]
    fn incomplete_without_present_support() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let indices = QueueFamilyIndices::find(&families, |_| Ok(false)).unwrap();

        assert_eq!(indices.graphics, Some(0));
        assert!(!indices.is_complete());
    }

    #[test]
    fn present_query_errors_propagate() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let result = QueueFamilyIndices::find(&families, |_| anyhow::bail!("lost surface"));
        assert!(result.is_err());
    }

    #[test]
    fn reports_missing_extensions() {
        let available = [extension(c"VK_KHR_maintenance1")];
        let missing = missing_extensions(&available, &required_device_extensions());
        assert_eq!(missing, vec!["VK_KHR_swapchain".to_string()]);

        let available = [extension(c"VK_KHR_swapchain"), extension(c"VK_KHR_maintenance1")];
        assert!(missing_extensions(&available, &required_device_extensions()).is_empty());
    }

    #[test]
    fn selects_first_suitable_device() {
        let no_present = DeviceCandidate {
            queue_families: QueueFamilyIndices {
                graphics: Some(0),
                present: None,
            },
            ..suitable("integrated")
        };
        let no_modes = DeviceCandidate {
            present_mode_count: 0,
            ..suitable("software")
        };
        let candidates = vec![
            (0, no_present),
            (1, no_modes),
            (2, suitable("discrete")),
            (3, suitable("second discrete")),
        ];

        let (id, candidate) = select_device(candidates).unwrap();
        assert_eq!(id, 2);
        assert_eq!(candidate.name, "discrete");
    }

    #[test]
    fn failed_build_releases_handles_newest_first() {
        let released = Rc::new(RefCell::new(Vec::new()));
        {
            let mut build = PartialBuild::new(ResourceTracker::new());
            for (kind, name) in [
                (None, "instance"),
                (Some(ResourceKind::DebugMessenger), "messenger"),
                (Some(ResourceKind::Surface), "surface"),
            ] {
                let released = released.clone();
                build.track(kind, move || released.borrow_mut().push(name));
            }
            assert_eq!(build.tracker.total_live(), 2);
        }
        assert_eq!(*released.borrow(), vec!["surface", "messenger", "instance"]);
    }

    #[test]
    fn finished_build_hands_over_live_handles() {
        let released = Rc::new(RefCell::new(Vec::new()));
        let mut build = PartialBuild::new(ResourceTracker::new());
        let undo = released.clone();
        build.track(Some(ResourceKind::Surface), move || undo.borrow_mut().push("surface"));

        let tracker = build.finish();
        assert!(released.borrow().is_empty());
        assert_eq!(tracker.live(ResourceKind::Surface), 1);
    }

    #[test]
    fn no_suitable_device_selects_nothing() {
        let missing_ext = DeviceCandidate {
            missing_extensions: vec!["VK_KHR_swapchain".into()],
            ..suitable("old")
        };
        assert!(select_device(vec![((), missing_ext)]).is_none());
    }
}
