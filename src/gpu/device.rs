// gpu/device.rs — wgpu device abstraction.
//
// Responsibilities:
//   - Enumerate Vulkan adapters and select the first hardware one.
//   - Expose a `DeviceProfile` for simulating a smaller device's limits on a
//     development machine.
//   - Provide `WorkgroupSize`, validated against the active profile and
//     substituted into every SGM shader.
//   - Wrap groups of device calls in wgpu error scopes, turning
//     out-of-memory and validation failures into `GpuError`s instead of
//     the default uncaptured-error panic.
//
// ERROR SCOPES AND THREADS:
// The scope stack belongs to the device, not to the calling thread. Engines
// and camera caches on different threads may share one `GpuDevice`, so
// `scoped` holds `scope_lock` from the first push to the last pop; a scope
// can then only ever pop the errors of its own calls.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` may grab llvmpipe on machines where the
// software renderer appears as a valid Vulkan device. We enumerate
// explicitly and prefer anything that is not DeviceType::Cpu.
//
// DEVICE LIMITS:
// Cost volumes are large: a 256×256-cell tile with 1500 depths is 375 MiB
// per volume. `Native` therefore requests the adapter's own limits rather
// than wgpu's conservative defaults. `Constrained` requests lower limits;
// wgpu validates every allocation and dispatch against the *requested*
// limits, so a configuration that would not fit the small device fails on
// the development machine already.
//
// NEW RUST CONCEPTS:
// - `pollster::block_on` — runs an async fn to completion on the current
//   thread. wgpu's adapter/device/error-scope API is async because on
//   WebGPU it maps to JS Promises; for native Vulkan we just block.
// - `#[derive(thiserror::Error)]` — Display and `source()` generated from
//   attributes.

use std::fmt;

use log::{info, warn};
use parking_lot::ReentrantMutex;
use thiserror::Error;

/// Hardware profile controlling device limits and default workgroup sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    /// Use the adapter's actual hardware limits.
    Native,
    /// Simulate a small embedded GPU: 256 invocations per workgroup,
    /// 128 MiB storage bindings, 4096² textures.
    Constrained,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::Constrained => write!(f, "Constrained (simulated limits)"),
        }
    }
}

/// A workgroup size configuration for compute dispatches.
///
/// 2-D kernels (fill, similarity, retrieve) use `x × y`. 1-D kernels that
/// put one invocation per depth hypothesis (aggregation) use `total()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    /// Total invocations per workgroup (x * y).
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Substitute `{{WG_X}}`, `{{WG_Y}}` and `{{WG_SIZE}}` in a shader template.
    pub fn apply(&self, template: &str) -> String {
        template
            .replace("{{WG_X}}", &self.x.to_string())
            .replace("{{WG_Y}}", &self.y.to_string())
            .replace("{{WG_SIZE}}", &self.total().to_string())
    }

    /// Validated default for the given profile.
    ///
    /// - `Native`: 16×8 = 128 invocations, 4 warps / 2 wavefronts.
    /// - `Constrained`: 8×8 = 64 invocations.
    fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize { x: 16, y: 8 },
            DeviceProfile::Constrained => WorkgroupSize { x: 8, y: 8 },
        }
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// The GPU context: device, queue, active profile and granted limits.
///
/// One `GpuDevice` is one execution queue. Engines that should overlap
/// work each get their own; engines sharing a device share its queue and
/// therefore run in submission order.
///
/// # Field drop order
/// Rust drops struct fields in declaration order. `_instance` is declared
/// last so the `wgpu::Instance` outlives `device` and `queue`; some Vulkan
/// layers crash when the instance is destroyed before its devices.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    /// Limits granted at device creation.
    pub limits: wgpu::Limits,
    /// Serializes push/pop pairs of error scopes across threads.
    /// Reentrant so a scoped section may open a nested one.
    scope_lock: ReentrantMutex<()>,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// First hardware Vulkan adapter with `DeviceProfile::Native` limits.
    pub fn new() -> Result<Self, GpuError> {
        Self::new_with_profile(DeviceProfile::Native)
    }

    pub fn new_with_profile(profile: DeviceProfile) -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(profile))
    }

    async fn init_async(profile: DeviceProfile) -> Result<Self, GpuError> {
        // ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER keeps layered drivers (dzn on
        // WSL2) in the list; compute kernels do not rely on anything the
        // conformance suite checks for rendering.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        let all_adapters: Vec<wgpu::Adapter> =
            instance.enumerate_adapters(wgpu::Backends::VULKAN).into_iter().collect();
        if all_adapters.is_empty() {
            return Err(GpuError::NoSuitableAdapter);
        }
        for a in &all_adapters {
            let info = a.get_info();
            info!("Vulkan adapter: {} ({:?}, {:?})", info.name, info.backend, info.device_type);
        }

        // Hardware first; a software adapter only as the last resort.
        let adapter = all_adapters
            .into_iter()
            .find(|a| !matches!(a.get_info().device_type, wgpu::DeviceType::Cpu))
            .or_else(|| instance.enumerate_adapters(wgpu::Backends::VULKAN).into_iter().next())
            .ok_or(GpuError::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        if raw_info.device_type == wgpu::DeviceType::Cpu {
            warn!("only a software Vulkan adapter is available: {}", raw_info.name);
        }
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };

        let limits = limits_for_profile(profile, adapter.limits());
        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("mvsgm"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(GpuError::DeviceRequest)?;

        let workgroup_size = WorkgroupSize::for_profile(profile);
        info!("GPU device: {adapter_info}, profile {profile}, workgroup {workgroup_size}");

        Ok(GpuDevice {
            device,
            queue,
            profile,
            adapter_info,
            workgroup_size,
            limits,
            scope_lock: ReentrantMutex::new(()),
            _instance: instance,
        })
    }

    /// Override the default workgroup size, validating against the granted limits.
    pub fn set_workgroup_size(&mut self, x: u32, y: u32) -> Result<(), GpuError> {
        let total = x * y;
        let max = self.limits.max_compute_invocations_per_workgroup;
        if total > max {
            return Err(GpuError::WorkgroupTooLarge { total, max });
        }
        self.workgroup_size = WorkgroupSize { x, y };
        Ok(())
    }

    /// Workgroups needed to cover a `w × h` grid with the active workgroup size.
    ///
    /// Shaders must guard against out-of-range global ids.
    pub fn dispatch_size(&self, w: u32, h: u32) -> (u32, u32) {
        dispatch_size(self.workgroup_size, w, h)
    }

    /// Largest storage buffer a kernel may bind on this device.
    pub fn max_storage_bytes(&self) -> u64 {
        (self.limits.max_storage_buffer_binding_size as u64).min(self.limits.max_buffer_size)
    }

    /// Run `f` inside out-of-memory and validation error scopes.
    ///
    /// Device calls made by `f` (allocations, pipeline creation, command
    /// submission) that fail are reported as `GpuError` tagged with `stage`
    /// instead of reaching the uncaptured-error handler.
    pub fn scoped<T>(&self, stage: &str, f: impl FnOnce() -> T) -> Result<T, GpuError> {
        let guard = self.scope_lock.lock();
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        drop(guard);
        if let Some(e) = oom {
            return Err(GpuError::OutOfMemory { label: stage.to_string(), message: e.to_string() });
        }
        if let Some(e) = validation {
            return Err(GpuError::Validation { stage: stage.to_string(), message: e.to_string() });
        }
        Ok(out)
    }

    /// Block until every submitted command has finished.
    pub fn wait_idle(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, profile: {}, workgroup: {} }}",
            self.adapter_info, self.profile, self.workgroup_size
        )
    }
}

/// Ceiling division of a `w × h` grid by `wg`.
pub fn dispatch_size(wg: WorkgroupSize, w: u32, h: u32) -> (u32, u32) {
    (w.div_ceil(wg.x), h.div_ceil(wg.y))
}

// ============================================================
// Limits helpers
// ============================================================

/// Limits to request for `profile` from an adapter supporting `adapter`.
fn limits_for_profile(profile: DeviceProfile, adapter: wgpu::Limits) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => adapter,
        DeviceProfile::Constrained => wgpu::Limits {
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            max_texture_dimension_2d: 4096,
            max_storage_buffer_binding_size: 128 << 20,
            max_buffer_size: 256 << 20,
            ..wgpu::Limits::default()
        },
    }
}

// ============================================================
// Error type
// ============================================================

/// Errors from GPU initialization, allocation and execution.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error(
        "no suitable Vulkan adapter found; ensure Vulkan is installed and \
         `vulkaninfo` lists a GPU"
    )]
    NoSuitableAdapter,

    #[error("device request failed: {0}")]
    DeviceRequest(#[source] wgpu::RequestDeviceError),

    #[error("workgroup size {total} exceeds the device limit of {max} invocations")]
    WorkgroupTooLarge { total: u32, max: u32 },

    #[error("buffer {label} needs {bytes} bytes, device allows {max}")]
    BufferTooLarge { label: String, bytes: u64, max: u64 },

    #[error("out of device memory while {label}: {message}")]
    OutOfMemory { label: String, message: String },

    #[error("device error during {stage}: {message}")]
    Validation { stage: String, message: String },

    #[error("buffer readback failed: {0}")]
    Readback(#[from] wgpu::BufferAsyncError),

    #[error("buffer map callback was dropped without reporting")]
    MapCallbackLost,
}

// ============================================================
// Tests
// ============================================================
