use std::ffi::{c_void, CStr, CString};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::{fs, slice};

use ash::ext::debug_utils as ext_debug;
use ash::khr::{surface, swapchain};
use ash::util::read_spv;
use ash::{vk, Entry, Instance};
use prism_render::{PresentPreference, RenderOptions, RenderSize, Renderer};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const SHADER_ENTRY: &CStr = c"main";

// Compiled by build.rs; used when the options carry no explicit paths.
const DEFAULT_VERT_SPV: &str = concat!(env!("OUT_DIR"), "/tri.vert.spv");
const DEFAULT_FRAG_SPV: &str = concat!(env!("OUT_DIR"), "/tri.frag.spv");

/// Everything that can go wrong between "process started" and "first frame
/// presented". Setup is one-shot: the first failure aborts construction.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("missing required {kind}: {name}")]
    MissingCapability { kind: &'static str, name: String },
    #[error("no Vulkan-capable adapter available")]
    NoSuitableDevice,
    #[error("no queue family supports both graphics and presentation")]
    NoSuitableQueueFamily,
    #[error("surface reports no compatible formats")]
    NoSurfaceFormats,
    #[error("surface reports no present modes")]
    NoPresentModes,
    #[error("could not load shader {}: {source}", .path.display())]
    ShaderLoad {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not create {what}: {code}")]
    ResourceCreation { what: &'static str, code: vk::Result },
}

fn vk_fail(what: &'static str) -> impl FnOnce(vk::Result) -> RenderError {
    move |code| RenderError::ResourceCreation { what, code }
}

pub struct VkRenderer {
    _entry: Entry,
    instance: Instance,
    debug: Option<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)>,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,

    phys: vk::PhysicalDevice,
    device: ash::Device,
    queue_family: u32,
    queue: vk::Queue,

    swapchain_loader: swapchain::Device,
    swapchain: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,

    render_pass: vk::RenderPass,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    framebuffers: Vec<vk::Framebuffer>,

    cmd_pool: vk::CommandPool,
    cmd_bufs: Vec<vk::CommandBuffer>,
    sync: FrameSync,

    clear: vk::ClearValue,
    present: PresentPreference,
    // Kept so the pipeline can be rebuilt against a new extent.
    vert_spv: Vec<u32>,
    frag_spv: Vec<u32>,
}

/// One binary semaphore pair, reused every frame. Single frame in flight:
/// the end-of-frame drain is what makes the reuse safe.
struct FrameSync {
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
}

// STRICT TEARDOWN ORDER (reverse of construction):
// - device_wait_idle() first; destroying in-flight objects is undefined
// - semaphores, framebuffers, pipeline, layout, render pass before views
// - image views before swapchain; swapchain before device
// - command pool before device (frees its buffers)
// - debug messenger and surface after device; instance last
impl Drop for VkRenderer {
    fn drop(&mut self) {
        unsafe {
            let d = &self.device;
            d.device_wait_idle().ok();

            d.destroy_semaphore(self.sync.image_available, None);
            d.destroy_semaphore(self.sync.render_finished, None);

            for &fb in &self.framebuffers {
                d.destroy_framebuffer(fb, None);
            }
            d.destroy_pipeline(self.pipeline, None);
            d.destroy_pipeline_layout(self.pipeline_layout, None);
            d.destroy_render_pass(self.render_pass, None);

            for &iv in &self.image_views {
                d.destroy_image_view(iv, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);

            d.destroy_command_pool(self.cmd_pool, None);
            d.destroy_device(None);

            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

// ---------------------------------------------------------------------------
// Capability probing

fn layer_names(props: &[vk::LayerProperties]) -> Vec<CString> {
    props
        .iter()
        .filter_map(|p| p.layer_name_as_c_str().ok().map(CString::from))
        .collect()
}

fn extension_names(props: &[vk::ExtensionProperties]) -> Vec<CString> {
    props
        .iter()
        .filter_map(|p| p.extension_name_as_c_str().ok().map(CString::from))
        .collect()
}

/// Fails on the first requested name the platform does not report.
fn check_required(
    kind: &'static str,
    required: &[&CStr],
    available: &[CString],
) -> Result<(), RenderError> {
    for &name in required {
        if !available.iter().any(|a| a.as_c_str() == name) {
            return Err(RenderError::MissingCapability {
                kind,
                name: name.to_string_lossy().into_owned(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Instance, debug messenger, adapter, device

unsafe fn create_instance(
    entry: &Entry,
    display_raw: RawDisplayHandle,
    validation: bool,
) -> Result<Instance, RenderError> {
    let mut layers: Vec<&CStr> = Vec::new();
    if validation {
        layers.push(VALIDATION_LAYER);
    }
    let available_layers = layer_names(
        &entry
            .enumerate_instance_layer_properties()
            .map_err(vk_fail("instance layer query"))?,
    );
    check_required("instance layer", &layers, &available_layers)?;

    let window_exts = ash_window::enumerate_required_extensions(display_raw)
        .map_err(vk_fail("window extension query"))?;
    let mut extensions: Vec<&CStr> = window_exts
        .iter()
        .map(|&p| unsafe { CStr::from_ptr(p) })
        .collect();
    if validation {
        extensions.push(ext_debug::NAME);
    }
    let available_exts = extension_names(
        &entry
            .enumerate_instance_extension_properties(None)
            .map_err(vk_fail("instance extension query"))?,
    );
    check_required("instance extension", &extensions, &available_exts)?;

    let app_name = c"prism";
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app_name.as_ptr(),
        application_version: 1,
        p_engine_name: app_name.as_ptr(),
        engine_version: 1,
        api_version: vk::API_VERSION_1_0,
        ..Default::default()
    };

    let layer_ptrs: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();
    let ext_ptrs: Vec<*const std::ffi::c_char> = extensions.iter().map(|e| e.as_ptr()).collect();

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_layer_count: layer_ptrs.len() as u32,
        pp_enabled_layer_names: layer_ptrs.as_ptr(),
        enabled_extension_count: ext_ptrs.len() as u32,
        pp_enabled_extension_names: ext_ptrs.as_ptr(),
        ..Default::default()
    };

    entry
        .create_instance(&create_info, None)
        .map_err(vk_fail("instance"))
}

/// Forwards driver diagnostics into tracing. The driver owns the callback's
/// lifetime; nothing here may block.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    let message = if data.is_null() || (*data).p_message.is_null() {
        String::new()
    } else {
        CStr::from_ptr((*data).p_message).to_string_lossy().into_owned()
    };

    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => error!("vk: {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!("vk: {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => info!("vk: {message}"),
        _ => debug!("vk: {message}"),
    }

    vk::FALSE
}

unsafe fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Result<(ext_debug::Instance, vk::DebugUtilsMessengerEXT), RenderError> {
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };

    let loader = ext_debug::Instance::new(entry, instance);
    let messenger = loader
        .create_debug_utils_messenger(&create_info, None)
        .map_err(vk_fail("debug messenger"))?;
    Ok((loader, messenger))
}

// First enumerated adapter. A production selector would score adapters by
// type, memory, and feature support.
unsafe fn pick_adapter(instance: &Instance) -> Result<vk::PhysicalDevice, RenderError> {
    let phys = instance
        .enumerate_physical_devices()
        .map_err(vk_fail("adapter enumeration"))?
        .first()
        .copied()
        .ok_or(RenderError::NoSuitableDevice)?;

    let props = instance.get_physical_device_properties(phys);
    if let Ok(name) = props.device_name_as_c_str() {
        info!("adapter: {} ({:?})", name.to_string_lossy(), props.device_type);
    }
    Ok(phys)
}

// Graphics and present are assumed to colocate on one family; a split
// design would need CONCURRENT image sharing or ownership transfers.
unsafe fn pick_queue_family(
    instance: &Instance,
    surface_loader: &surface::Instance,
    phys: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Result<u32, RenderError> {
    let qprops = instance.get_physical_device_queue_family_properties(phys);
    for (i, q) in qprops.iter().enumerate() {
        if q.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && surface_loader
                .get_physical_device_surface_support(phys, i as u32, surface)
                .unwrap_or(false)
        {
            return Ok(i as u32);
        }
    }
    Err(RenderError::NoSuitableQueueFamily)
}

unsafe fn create_device(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<ash::Device, RenderError> {
    let required = [swapchain::NAME];
    let available = extension_names(
        &instance
            .enumerate_device_extension_properties(phys)
            .map_err(vk_fail("device extension query"))?,
    );
    check_required("device extension", &required, &available)?;

    let priorities = [1.0_f32];
    let queue_info = vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: queue_family,
        queue_count: 1,
        p_queue_priorities: priorities.as_ptr(),
        ..Default::default()
    };

    let ext_ptrs = [swapchain::NAME.as_ptr()];
    let device_info = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: 1,
        p_queue_create_infos: &queue_info,
        enabled_extension_count: ext_ptrs.len() as u32,
        pp_enabled_extension_names: ext_ptrs.as_ptr(),
        ..Default::default()
    };

    instance
        .create_device(phys, &device_info, None)
        .map_err(vk_fail("device"))
}

// ---------------------------------------------------------------------------
// Presentation chain negotiation (pure; the driver only supplies the inputs)

#[derive(Clone, Copy, Debug)]
struct ChainPlan {
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    image_count: u32,
    pre_transform: vk::SurfaceTransformFlagsKHR,
}

fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .unwrap_or(formats[0])
}

fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    prefer: PresentPreference,
) -> vk::PresentModeKHR {
    if prefer == PresentPreference::LowLatency
        && modes.iter().any(|&m| m == vk::PresentModeKHR::MAILBOX)
    {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

fn chain_extent(caps: &vk::SurfaceCapabilitiesKHR, window: RenderSize) -> vk::Extent2D {
    // u32::MAX width is the sentinel for "surface takes the window's size".
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: window
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: window
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

fn chain_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    // max_image_count == 0 means the surface imposes no upper bound.
    if caps.max_image_count == 0 {
        caps.min_image_count + 1
    } else {
        (caps.min_image_count + 1).min(caps.max_image_count)
    }
}

fn plan_chain(
    caps: &vk::SurfaceCapabilitiesKHR,
    formats: &[vk::SurfaceFormatKHR],
    modes: &[vk::PresentModeKHR],
    window: RenderSize,
    prefer: PresentPreference,
) -> Result<ChainPlan, RenderError> {
    if formats.is_empty() {
        return Err(RenderError::NoSurfaceFormats);
    }
    if modes.is_empty() {
        return Err(RenderError::NoPresentModes);
    }
    Ok(ChainPlan {
        format: choose_surface_format(formats),
        present_mode: choose_present_mode(modes, prefer),
        extent: chain_extent(caps, window),
        image_count: chain_image_count(caps),
        pre_transform: caps.current_transform,
    })
}

// ---------------------------------------------------------------------------
// Chain, pipeline, framebuffers, commands, sync

#[allow(clippy::type_complexity)]
unsafe fn create_swapchain_bundle(
    device: &ash::Device,
    surface_loader: &surface::Instance,
    swapchain_loader: &swapchain::Device,
    phys: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    window: RenderSize,
    prefer: PresentPreference,
) -> Result<(vk::SwapchainKHR, vk::Format, vk::Extent2D, Vec<vk::Image>, Vec<vk::ImageView>), RenderError>
{
    let caps = surface_loader
        .get_physical_device_surface_capabilities(phys, surface)
        .map_err(vk_fail("surface capability query"))?;
    let formats = surface_loader
        .get_physical_device_surface_formats(phys, surface)
        .map_err(vk_fail("surface format query"))?;
    let modes = surface_loader
        .get_physical_device_surface_present_modes(phys, surface)
        .map_err(vk_fail("present mode query"))?;

    let plan = plan_chain(&caps, &formats, &modes, window, prefer)?;
    info!(
        "chain: {}x{}, {} images, {:?}, {:?}",
        plan.extent.width, plan.extent.height, plan.image_count, plan.format.format, plan.present_mode
    );

    let swap_info = vk::SwapchainCreateInfoKHR {
        s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
        surface,
        min_image_count: plan.image_count,
        image_format: plan.format.format,
        image_color_space: plan.format.color_space,
        image_extent: plan.extent,
        image_array_layers: 1,
        image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        image_sharing_mode: vk::SharingMode::EXCLUSIVE,
        pre_transform: plan.pre_transform,
        composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
        present_mode: plan.present_mode,
        clipped: vk::TRUE,
        ..Default::default()
    };

    let swapchain = swapchain_loader
        .create_swapchain(&swap_info, None)
        .map_err(vk_fail("swapchain"))?;
    let images = swapchain_loader
        .get_swapchain_images(swapchain)
        .map_err(vk_fail("swapchain image query"))?;

    let mut views = Vec::with_capacity(images.len());
    for &img in &images {
        let sub = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let iv_info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image: img,
            view_type: vk::ImageViewType::TYPE_2D,
            format: plan.format.format,
            subresource_range: sub,
            ..Default::default()
        };
        views.push(
            device
                .create_image_view(&iv_info, None)
                .map_err(vk_fail("image view"))?,
        );
    }

    Ok((swapchain, plan.format.format, plan.extent, images, views))
}

unsafe fn create_render_pass(
    device: &ash::Device,
    format: vk::Format,
) -> Result<vk::RenderPass, RenderError> {
    let color_att = vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let att_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };

    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &att_ref,
        ..Default::default()
    };

    // The previous frame's color-attachment output must retire before this
    // frame writes the same attachment; earlier stages run unordered.
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ..Default::default()
    };

    let rp_info = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_att,
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    device
        .create_render_pass(&rp_info, None)
        .map_err(vk_fail("render pass"))
}

/// Read a whole SPIR-V blob from disk. Word alignment is validated by
/// `read_spv`; any miss is fatal at startup.
fn load_spirv(path: &Path) -> Result<Vec<u32>, RenderError> {
    let bytes = fs::read(path).map_err(|source| RenderError::ShaderLoad {
        path: path.to_owned(),
        source,
    })?;
    read_spv(&mut Cursor::new(bytes)).map_err(|source| RenderError::ShaderLoad {
        path: path.to_owned(),
        source,
    })
}

unsafe fn create_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    vert_spv: &[u32],
    frag_spv: &[u32],
) -> Result<(vk::PipelineLayout, vk::Pipeline), RenderError> {
    let vert_info = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        code_size: vert_spv.len() * 4,
        p_code: vert_spv.as_ptr(),
        ..Default::default()
    };
    let vert_module = device
        .create_shader_module(&vert_info, None)
        .map_err(vk_fail("vertex shader module"))?;

    let frag_info = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        code_size: frag_spv.len() * 4,
        p_code: frag_spv.as_ptr(),
        ..Default::default()
    };
    let frag_module = match device.create_shader_module(&frag_info, None) {
        Ok(m) => m,
        Err(code) => {
            device.destroy_shader_module(vert_module, None);
            return Err(vk_fail("fragment shader module")(code));
        }
    };

    let stages = [
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::VERTEX,
            module: vert_module,
            p_name: SHADER_ENTRY.as_ptr(),
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: frag_module,
            p_name: SHADER_ENTRY.as_ptr(),
            ..Default::default()
        },
    ];

    // No vertex buffers: the vertex shader carries the geometry.
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        ..Default::default()
    };

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        primitive_restart_enable: vk::FALSE,
        ..Default::default()
    };

    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        p_viewports: &viewport,
        scissor_count: 1,
        p_scissors: &scissor,
        ..Default::default()
    };

    let rasterization = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::BACK,
        front_face: vk::FrontFace::CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };

    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };

    let blend_attachment = vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::FALSE,
        color_write_mask: vk::ColorComponentFlags::RGBA,
        ..Default::default()
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &blend_attachment,
        ..Default::default()
    };

    // No descriptor sets or push constants in this pipeline.
    let layout_info = vk::PipelineLayoutCreateInfo {
        s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
        ..Default::default()
    };
    let layout = match device.create_pipeline_layout(&layout_info, None) {
        Ok(l) => l,
        Err(code) => {
            device.destroy_shader_module(vert_module, None);
            device.destroy_shader_module(frag_module, None);
            return Err(vk_fail("pipeline layout")(code));
        }
    };

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &rasterization,
        p_multisample_state: &multisample,
        p_color_blend_state: &color_blend,
        layout,
        render_pass,
        subpass: 0,
        ..Default::default()
    };

    let result = device.create_graphics_pipelines(
        vk::PipelineCache::null(),
        slice::from_ref(&pipeline_info),
        None,
    );

    // Modules are only needed while the pipeline is being compiled.
    device.destroy_shader_module(vert_module, None);
    device.destroy_shader_module(frag_module, None);

    match result {
        Ok(pipelines) => Ok((layout, pipelines[0])),
        Err((_, code)) => {
            device.destroy_pipeline_layout(layout, None);
            Err(vk_fail("graphics pipeline")(code))
        }
    }
}

unsafe fn create_framebuffers(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    views: &[vk::ImageView],
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>, RenderError> {
    let mut framebuffers = Vec::with_capacity(views.len());
    for &view in views {
        let fb_info = vk::FramebufferCreateInfo {
            s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
            render_pass,
            attachment_count: 1,
            p_attachments: &view,
            width: extent.width,
            height: extent.height,
            layers: 1,
            ..Default::default()
        };
        framebuffers.push(
            device
                .create_framebuffer(&fb_info, None)
                .map_err(vk_fail("framebuffer"))?,
        );
    }
    Ok(framebuffers)
}

unsafe fn allocate_command_buffers(
    device: &ash::Device,
    cmd_pool: vk::CommandPool,
    count: usize,
) -> Result<Vec<vk::CommandBuffer>, RenderError> {
    let alloc_info = vk::CommandBufferAllocateInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
        command_pool: cmd_pool,
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: count as u32,
        ..Default::default()
    };
    device
        .allocate_command_buffers(&alloc_info)
        .map_err(vk_fail("command buffers"))
}

/// Pre-record every command buffer once: the draw never changes between
/// frames, so the loop only submits.
unsafe fn record_commands(
    device: &ash::Device,
    cmd_bufs: &[vk::CommandBuffer],
    framebuffers: &[vk::Framebuffer],
    render_pass: vk::RenderPass,
    pipeline: vk::Pipeline,
    extent: vk::Extent2D,
    clear: vk::ClearValue,
) -> Result<(), RenderError> {
    for (i, &cmd) in cmd_bufs.iter().enumerate() {
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            ..Default::default()
        };
        device
            .begin_command_buffer(cmd, &begin)
            .map_err(vk_fail("command recording"))?;

        let clears = [clear];
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass,
            framebuffer: framebuffers[i],
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            clear_value_count: clears.len() as u32,
            p_clear_values: clears.as_ptr(),
            ..Default::default()
        };

        device.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
        device.cmd_draw(cmd, 3, 1, 0, 0);
        device.cmd_end_render_pass(cmd);

        device
            .end_command_buffer(cmd)
            .map_err(vk_fail("command recording"))?;
    }
    Ok(())
}

unsafe fn create_sync_pair(device: &ash::Device) -> Result<FrameSync, RenderError> {
    let sem_info = vk::SemaphoreCreateInfo::default();
    let image_available = device
        .create_semaphore(&sem_info, None)
        .map_err(vk_fail("semaphore"))?;
    let render_finished = device
        .create_semaphore(&sem_info, None)
        .map_err(vk_fail("semaphore"))?;
    Ok(FrameSync {
        image_available,
        render_finished,
    })
}

// ---------------------------------------------------------------------------
// Construction: each stage's output feeds the next; none can be reordered.

unsafe fn build_renderer(
    window: &dyn HasWindowHandle,
    display: &dyn HasDisplayHandle,
    size: RenderSize,
    opts: RenderOptions,
) -> Result<VkRenderer, anyhow::Error> {
    let entry = Entry::linked();

    let dh: RawDisplayHandle = display.display_handle()?.as_raw();
    let wh: RawWindowHandle = window.window_handle()?.as_raw();

    let instance = create_instance(&entry, dh, opts.validation)?;
    let debug = if opts.validation {
        Some(create_debug_messenger(&entry, &instance)?)
    } else {
        None
    };

    let surface = ash_window::create_surface(&entry, &instance, dh, wh, None)
        .map_err(vk_fail("window surface"))?;
    let surface_loader = surface::Instance::new(&entry, &instance);

    let phys = pick_adapter(&instance)?;
    let queue_family = pick_queue_family(&instance, &surface_loader, phys, surface)?;
    let device = create_device(&instance, phys, queue_family)?;
    let queue = device.get_device_queue(queue_family, 0);

    let vert_path = opts
        .vert_shader
        .unwrap_or_else(|| PathBuf::from(DEFAULT_VERT_SPV));
    let frag_path = opts
        .frag_shader
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FRAG_SPV));
    let vert_spv = load_spirv(&vert_path)?;
    let frag_spv = load_spirv(&frag_path)?;

    let swapchain_loader = swapchain::Device::new(&instance, &device);
    let (swapchain, format, extent, images, image_views) = create_swapchain_bundle(
        &device,
        &surface_loader,
        &swapchain_loader,
        phys,
        surface,
        size,
        opts.present,
    )?;

    let render_pass = create_render_pass(&device, format)?;
    let (pipeline_layout, pipeline) =
        create_pipeline(&device, render_pass, extent, &vert_spv, &frag_spv)?;
    let framebuffers = create_framebuffers(&device, render_pass, &image_views, extent)?;

    let pool_info = vk::CommandPoolCreateInfo {
        s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
        queue_family_index: queue_family,
        ..Default::default()
    };
    let cmd_pool = device
        .create_command_pool(&pool_info, None)
        .map_err(vk_fail("command pool"))?;
    let cmd_bufs = allocate_command_buffers(&device, cmd_pool, framebuffers.len())?;

    let clear = vk::ClearValue {
        color: vk::ClearColorValue {
            float32: opts.clear_color,
        },
    };
    record_commands(
        &device,
        &cmd_bufs,
        &framebuffers,
        render_pass,
        pipeline,
        extent,
        clear,
    )?;

    let sync = create_sync_pair(&device)?;

    Ok(VkRenderer {
        _entry: entry,
        instance,
        debug,
        surface_loader,
        surface,
        phys,
        device,
        queue_family,
        queue,
        swapchain_loader,
        swapchain,
        format,
        extent,
        images,
        image_views,
        render_pass,
        pipeline_layout,
        pipeline,
        framebuffers,
        cmd_pool,
        cmd_bufs,
        sync,
        clear,
        present: opts.present,
        vert_spv,
        frag_spv,
    })
}

// ---------------------------------------------------------------------------
// Frame loop

/// The four per-frame operations, in the only order that is correct with a
/// single reusable semaphore pair. Split out so the sequencing can be
/// exercised against a scripted queue.
trait FrameQueue {
    /// `None` means no image was available this frame (the chain was just
    /// rebuilt); the iteration ends without submitting.
    fn acquire_image(&mut self) -> Result<Option<u32>, RenderError>;
    fn submit_draw(&mut self, image: u32) -> Result<(), RenderError>;
    fn present_image(&mut self, image: u32) -> Result<(), RenderError>;
    /// Block until the queue is idle. With one semaphore pair and no
    /// per-frame fences, skipping this would reuse `image_available` while
    /// the GPU may not have consumed the previous signal.
    fn drain(&mut self) -> Result<(), RenderError>;
}

fn drive_frame<Q: FrameQueue>(q: &mut Q) -> Result<(), RenderError> {
    let Some(image) = q.acquire_image()? else {
        return Ok(());
    };
    q.submit_draw(image)?;
    q.present_image(image)?;
    q.drain()
}

impl FrameQueue for VkRenderer {
    fn acquire_image(&mut self) -> Result<Option<u32>, RenderError> {
        unsafe {
            match self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.sync.image_available,
                vk::Fence::null(),
            ) {
                Ok((image_index, _suboptimal)) => Ok(Some(image_index)),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    let hint = RenderSize {
                        width: self.extent.width,
                        height: self.extent.height,
                    };
                    self.recreate_swapchain(hint)?;
                    Ok(None)
                }
                Err(code) => Err(vk_fail("image acquire")(code)),
            }
        }
    }

    fn submit_draw(&mut self, image: u32) -> Result<(), RenderError> {
        let cmd = self.cmd_bufs[image as usize];
        // Earlier pipeline stages may run before the image is ready; only
        // color-attachment output waits on the acquire signal.
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &self.sync.image_available,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &self.sync.render_finished,
            ..Default::default()
        };
        unsafe {
            self.device
                .queue_submit(self.queue, slice::from_ref(&submit), vk::Fence::null())
                .map_err(vk_fail("queue submit"))
        }
    }

    fn present_image(&mut self, image: u32) -> Result<(), RenderError> {
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &self.sync.render_finished,
            swapchain_count: 1,
            p_swapchains: &self.swapchain,
            p_image_indices: &image,
            ..Default::default()
        };
        unsafe {
            match self.swapchain_loader.queue_present(self.queue, &present) {
                Ok(_) => Ok(()),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    let hint = RenderSize {
                        width: self.extent.width,
                        height: self.extent.height,
                    };
                    self.recreate_swapchain(hint)
                }
                Err(code) => Err(vk_fail("queue present")(code)),
            }
        }
    }

    fn drain(&mut self) -> Result<(), RenderError> {
        unsafe {
            self.device
                .queue_wait_idle(self.queue)
                .map_err(vk_fail("queue drain"))
        }
    }
}

impl VkRenderer {
    /// Teardown-and-rebuild entry point: everything downstream of the
    /// chosen extent (images, views, render pass, pipeline viewport,
    /// framebuffers, recorded commands) is replaced.
    unsafe fn recreate_swapchain(&mut self, size: RenderSize) -> Result<(), RenderError> {
        self.device.device_wait_idle().ok();

        for &fb in &self.framebuffers {
            self.device.destroy_framebuffer(fb, None);
        }
        self.device.destroy_pipeline(self.pipeline, None);
        self.device
            .destroy_pipeline_layout(self.pipeline_layout, None);
        self.device.destroy_render_pass(self.render_pass, None);
        for &iv in &self.image_views {
            self.device.destroy_image_view(iv, None);
        }
        self.swapchain_loader
            .destroy_swapchain(self.swapchain, None);
        // The image count may change with the new extent.
        self.device
            .free_command_buffers(self.cmd_pool, &self.cmd_bufs);

        let (swapchain, format, extent, images, image_views) = create_swapchain_bundle(
            &self.device,
            &self.surface_loader,
            &self.swapchain_loader,
            self.phys,
            self.surface,
            size,
            self.present,
        )?;
        let render_pass = create_render_pass(&self.device, format)?;
        let (pipeline_layout, pipeline) = create_pipeline(
            &self.device,
            render_pass,
            extent,
            &self.vert_spv,
            &self.frag_spv,
        )?;
        let framebuffers = create_framebuffers(&self.device, render_pass, &image_views, extent)?;
        let cmd_bufs = allocate_command_buffers(&self.device, self.cmd_pool, framebuffers.len())?;

        self.swapchain = swapchain;
        self.format = format;
        self.extent = extent;
        self.images = images;
        self.image_views = image_views;
        self.render_pass = render_pass;
        self.pipeline_layout = pipeline_layout;
        self.pipeline = pipeline;
        self.framebuffers = framebuffers;
        self.cmd_bufs = cmd_bufs;

        record_commands(
            &self.device,
            &self.cmd_bufs,
            &self.framebuffers,
            self.render_pass,
            self.pipeline,
            self.extent,
            self.clear,
        )
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        opts: RenderOptions,
    ) -> anyhow::Result<Self> {
        let r = unsafe { build_renderer(window, display, size, opts)? };
        info!(
            "vulkan ready ({}x{}, {} images, {:?}, queue family {})",
            r.extent.width,
            r.extent.height,
            r.images.len(),
            r.format,
            r.queue_family
        );
        Ok(r)
    }

    fn resize(&mut self, size: RenderSize) -> anyhow::Result<()> {
        unsafe { Ok(self.recreate_swapchain(size)?) }
    }

    fn render(&mut self) -> anyhow::Result<()> {
        Ok(drive_frame(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn caps(
        min_count: u32,
        max_count: u32,
        current: (u32, u32),
        min_extent: (u32, u32),
        max_extent: (u32, u32),
    ) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_count,
            max_image_count: max_count,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min_extent.0,
                height: min_extent.1,
            },
            max_image_extent: vk::Extent2D {
                width: max_extent.0,
                height: max_extent.1,
            },
            ..Default::default()
        }
    }

    const BGRA_SRGB: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };
    const RGBA_UNORM: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
        format: vk::Format::R8G8B8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    #[test]
    fn image_count_is_min_plus_one_within_bounds() {
        let c = caps(2, 3, (800, 600), (1, 1), (2048, 2048));
        assert_eq!(chain_image_count(&c), 3);

        let tight = caps(3, 3, (800, 600), (1, 1), (2048, 2048));
        assert_eq!(chain_image_count(&tight), 3);
    }

    #[test]
    fn image_count_unbounded_when_max_is_zero() {
        let c = caps(2, 0, (800, 600), (1, 1), (2048, 2048));
        assert_eq!(chain_image_count(&c), 3);
    }

    #[test]
    fn extent_takes_defined_current_extent_verbatim() {
        let c = caps(2, 3, (800, 600), (1, 1), (2048, 2048));
        let e = chain_extent(
            &c,
            RenderSize {
                width: 4096,
                height: 4096,
            },
        );
        assert_eq!((e.width, e.height), (800, 600));
    }

    #[test]
    fn extent_falls_back_to_window_size_when_undefined() {
        let c = caps(2, 3, (u32::MAX, u32::MAX), (1, 1), (2048, 2048));
        let e = chain_extent(
            &c,
            RenderSize {
                width: 1024,
                height: 768,
            },
        );
        assert_eq!((e.width, e.height), (1024, 768));
    }

    #[test]
    fn extent_fallback_clamps_into_surface_bounds() {
        let c = caps(2, 3, (u32::MAX, u32::MAX), (64, 64), (2048, 2048));
        let e = chain_extent(
            &c,
            RenderSize {
                width: 4096,
                height: 16,
            },
        );
        assert_eq!((e.width, e.height), (2048, 64));
    }

    #[test]
    fn format_prefers_bgra_srgb() {
        let formats = [RGBA_UNORM, BGRA_SRGB];
        let chosen = choose_surface_format(&formats);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn format_falls_back_to_first_reported() {
        let formats = [RGBA_UNORM];
        assert_eq!(choose_surface_format(&formats).format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn format_selection_is_idempotent() {
        let formats = [RGBA_UNORM, BGRA_SRGB, RGBA_UNORM];
        let first = choose_surface_format(&formats);
        for _ in 0..8 {
            let again = choose_surface_format(&formats);
            assert_eq!(again.format, first.format);
            assert_eq!(again.color_space, first.color_space);
        }
    }

    #[test]
    fn present_mode_takes_mailbox_only_when_offered() {
        let offered = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&offered, PresentPreference::LowLatency),
            vk::PresentModeKHR::MAILBOX
        );

        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&fifo_only, PresentPreference::LowLatency),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn present_mode_never_picks_a_third_mode() {
        let offered = [
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::FIFO_RELAXED,
            vk::PresentModeKHR::FIFO,
        ];
        assert_eq!(
            choose_present_mode(&offered, PresentPreference::LowLatency),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&offered, PresentPreference::Vsync),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn vsync_preference_ignores_mailbox() {
        let offered = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&offered, PresentPreference::Vsync),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn plan_negotiates_the_reference_surface() {
        let c = caps(2, 3, (800, 600), (1, 1), (2048, 2048));
        let plan = plan_chain(
            &c,
            &[BGRA_SRGB],
            &[vk::PresentModeKHR::FIFO],
            RenderSize {
                width: 800,
                height: 600,
            },
            PresentPreference::LowLatency,
        )
        .unwrap();

        assert_eq!(plan.image_count, 3);
        assert_eq!((plan.extent.width, plan.extent.height), (800, 600));
        assert_eq!(plan.format.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(plan.format.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        assert_eq!(plan.present_mode, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn plan_uses_window_size_when_surface_extent_is_undefined() {
        let c = caps(2, 3, (u32::MAX, u32::MAX), (1, 1), (2048, 2048));
        let plan = plan_chain(
            &c,
            &[BGRA_SRGB],
            &[vk::PresentModeKHR::FIFO],
            RenderSize {
                width: 1024,
                height: 768,
            },
            PresentPreference::LowLatency,
        )
        .unwrap();
        assert_eq!((plan.extent.width, plan.extent.height), (1024, 768));
    }

    #[test]
    fn plan_rejects_surfaces_without_formats_or_modes() {
        let c = caps(2, 3, (800, 600), (1, 1), (2048, 2048));
        let window = RenderSize {
            width: 800,
            height: 600,
        };
        assert!(matches!(
            plan_chain(&c, &[], &[vk::PresentModeKHR::FIFO], window, PresentPreference::Vsync),
            Err(RenderError::NoSurfaceFormats)
        ));
        assert!(matches!(
            plan_chain(&c, &[BGRA_SRGB], &[], window, PresentPreference::Vsync),
            Err(RenderError::NoPresentModes)
        ));
    }

    #[test]
    fn probe_names_the_first_missing_requirement() {
        let available = vec![
            CString::new("VK_KHR_surface").unwrap(),
            CString::new("VK_KHR_xcb_surface").unwrap(),
        ];
        let required: Vec<&CStr> = vec![
            c"VK_KHR_surface",
            c"VK_LAYER_KHRONOS_validation",
            c"VK_EXT_debug_utils",
        ];

        let err = check_required("instance layer", &required, &available).unwrap_err();
        match err {
            RenderError::MissingCapability { kind, name } => {
                assert_eq!(kind, "instance layer");
                assert_eq!(name, "VK_LAYER_KHRONOS_validation");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn probe_accepts_a_satisfied_requirement_set() {
        let available = vec![
            CString::new("VK_KHR_swapchain").unwrap(),
            CString::new("VK_KHR_maintenance1").unwrap(),
        ];
        check_required("device extension", &[c"VK_KHR_swapchain"], &available).unwrap();
        check_required("device extension", &[], &available).unwrap();
    }

    #[test]
    fn missing_shader_blob_is_fatal() {
        let err = load_spirv(Path::new("/nonexistent/prism/tri.vert.spv")).unwrap_err();
        assert!(matches!(err, RenderError::ShaderLoad { .. }));
    }

    // -- frame-loop sequencing ---------------------------------------------

    #[derive(Debug, PartialEq, Eq)]
    enum Step {
        Acquire,
        Submit(u32),
        Present(u32),
        Drain,
        TearDown,
    }

    struct ScriptedQueue {
        log: Rc<RefCell<Vec<Step>>>,
        image_count: u32,
        next_image: u32,
    }

    impl ScriptedQueue {
        fn new(log: Rc<RefCell<Vec<Step>>>, image_count: u32) -> Self {
            ScriptedQueue {
                log,
                image_count,
                next_image: 0,
            }
        }
    }

    impl Drop for ScriptedQueue {
        fn drop(&mut self) {
            self.log.borrow_mut().push(Step::TearDown);
        }
    }

    impl FrameQueue for ScriptedQueue {
        fn acquire_image(&mut self) -> Result<Option<u32>, RenderError> {
            self.log.borrow_mut().push(Step::Acquire);
            let image = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            Ok(Some(image))
        }

        fn submit_draw(&mut self, image: u32) -> Result<(), RenderError> {
            self.log.borrow_mut().push(Step::Submit(image));
            Ok(())
        }

        fn present_image(&mut self, image: u32) -> Result<(), RenderError> {
            self.log.borrow_mut().push(Step::Present(image));
            Ok(())
        }

        fn drain(&mut self) -> Result<(), RenderError> {
            self.log.borrow_mut().push(Step::Drain);
            Ok(())
        }
    }

    #[test]
    fn frame_loop_runs_acquire_submit_present_drain_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = ScriptedQueue::new(Rc::clone(&log), 3);

        let iterations = 5;
        for _ in 0..iterations {
            drive_frame(&mut q).unwrap();
        }
        drop(q);

        let log = log.borrow();
        assert_eq!(log.len(), iterations * 4 + 1);
        for i in 0..iterations {
            let image = (i % 3) as u32;
            assert_eq!(log[i * 4], Step::Acquire);
            assert_eq!(log[i * 4 + 1], Step::Submit(image));
            assert_eq!(log[i * 4 + 2], Step::Present(image));
            assert_eq!(log[i * 4 + 3], Step::Drain);
        }
        // Teardown strictly after the final drain.
        assert_eq!(log[iterations * 4], Step::TearDown);
    }

    #[test]
    fn frame_loop_skips_submission_when_no_image_is_available() {
        struct RebuiltQueue {
            log: Vec<&'static str>,
        }
        impl FrameQueue for RebuiltQueue {
            fn acquire_image(&mut self) -> Result<Option<u32>, RenderError> {
                self.log.push("acquire");
                Ok(None)
            }
            fn submit_draw(&mut self, _image: u32) -> Result<(), RenderError> {
                self.log.push("submit");
                Ok(())
            }
            fn present_image(&mut self, _image: u32) -> Result<(), RenderError> {
                self.log.push("present");
                Ok(())
            }
            fn drain(&mut self) -> Result<(), RenderError> {
                self.log.push("drain");
                Ok(())
            }
        }

        let mut q = RebuiltQueue { log: Vec::new() };
        drive_frame(&mut q).unwrap();
        assert_eq!(q.log, ["acquire"]);
    }

    #[test]
    fn frame_loop_stops_at_the_first_failure() {
        struct FailingSubmit;
        impl FrameQueue for FailingSubmit {
            fn acquire_image(&mut self) -> Result<Option<u32>, RenderError> {
                Ok(Some(0))
            }
            fn submit_draw(&mut self, _image: u32) -> Result<(), RenderError> {
                Err(RenderError::ResourceCreation {
                    what: "queue submit",
                    code: vk::Result::ERROR_DEVICE_LOST,
                })
            }
            fn present_image(&mut self, _image: u32) -> Result<(), RenderError> {
                panic!("present must not run after a failed submit");
            }
            fn drain(&mut self) -> Result<(), RenderError> {
                panic!("drain must not run after a failed submit");
            }
        }

        let err = drive_frame(&mut FailingSubmit).unwrap_err();
        assert!(matches!(err, RenderError::ResourceCreation { what: "queue submit", .. }));
    }
}
