//! wgpu implementation of the separable convolution.
//!
//! All device buffers are sized once for the geometry in [`prepare`] and reused
//! for every call. They are destroyed when the engine is dropped.
//!
//! [`prepare`]: GpuSeparableConvolution::prepare

use std::sync::mpsc;
use std::time::Instant;

use tracing::{debug, info};

use super::{
    shaders, validate_operands, EngineError, EngineResult, SeparableConvolution, ShaderInfo,
};
use crate::tensor::Tensor;
use crate::tier::ConvolutionGeometry;

const F32_SIZE: u64 = std::mem::size_of::<f32>() as u64;

/// Summary of one GPU adapter, for listing.
#[derive(Debug, Clone)]
pub struct AdapterSummary {
    pub name: String,
    pub backend: String,
    pub device_type: String,
    pub driver: String,
    pub max_storage_binding_bytes: u64,
}

impl From<&wgpu::Adapter> for AdapterSummary {
    fn from(adapter: &wgpu::Adapter) -> Self {
        let info = adapter.get_info();
        let limits = adapter.limits();
        Self {
            name: info.name,
            backend: format!("{:?}", info.backend),
            device_type: format!("{:?}", info.device_type),
            driver: format!("{} {}", info.driver, info.driver_info).trim().to_string(),
            max_storage_binding_bytes: limits.max_storage_buffer_binding_size as u64,
        }
    }
}

/// Enumerates every adapter wgpu can see, plus the adapter
/// [`GpuSeparableConvolution::prepare`] would pick, if any.
pub fn list_adapters() -> (Vec<AdapterSummary>, Option<AdapterSummary>) {
    let instance = new_instance();
    let all = instance
        .enumerate_adapters(wgpu::Backends::all())
        .iter()
        .map(AdapterSummary::from)
        .collect();
    let preferred =
        pollster::block_on(request_adapter(&instance)).map(|a| AdapterSummary::from(&a));
    (all, preferred)
}

fn new_instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    })
}

async fn request_adapter(instance: &wgpu::Instance) -> Option<wgpu::Adapter> {
    instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
}

struct EngineBuffers {
    input: wgpu::Buffer,
    output: wgpu::Buffer,
    vertical: wgpu::Buffer,
    horizontal: wgpu::Buffer,
    info: wgpu::Buffer,
    staging: wgpu::Buffer,
}

impl Drop for EngineBuffers {
    fn drop(&mut self) {
        for buffer in [
            &self.input,
            &self.output,
            &self.vertical,
            &self.horizontal,
            &self.info,
            &self.staging,
        ] {
            buffer.destroy();
        }
    }
}

struct GpuState {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    // Declared after the bind group so buffers outlive it on drop.
    buffers: EngineBuffers,
}

pub struct GpuSeparableConvolution {
    geometry: ConvolutionGeometry,
    state: Option<GpuState>,
    adapter_name: Option<String>,
}

impl GpuSeparableConvolution {
    pub fn new(geometry: ConvolutionGeometry) -> Self {
        Self {
            geometry,
            state: None,
            adapter_name: None,
        }
    }

    pub fn adapter_name(&self) -> Option<&str> {
        self.adapter_name.as_deref()
    }

    async fn init(&self) -> EngineResult<(GpuState, String)> {
        let instance = new_instance();
        let adapter = request_adapter(&instance).await.ok_or_else(|| {
            EngineError::EngineUnavailable("no adapter matched the request".to_string())
        })?;
        let adapter_info = adapter.get_info();
        let adapter_limits = adapter.limits();

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("sepconv_device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter_limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                    ..Default::default()
                },
                None,
            )
            .await
            .map_err(|e| EngineError::EngineUnavailable(e.to_string()))?;

        let g = &self.geometry;
        let sizes = [
            ("input", g.input_len() as u64 * F32_SIZE),
            ("vertical", g.kernel_len() as u64 * F32_SIZE),
            ("horizontal", g.kernel_len() as u64 * F32_SIZE),
            ("output", g.output_len() as u64 * F32_SIZE),
        ];
        let max_binding = adapter_limits.max_storage_buffer_binding_size as u64;
        for (label, bytes) in sizes {
            if bytes > max_binding || bytes > adapter_limits.max_buffer_size {
                return Err(EngineError::AllocationFailed {
                    label,
                    bytes,
                    reason: format!(
                        "adapter '{}' allows at most {max_binding} bytes per storage binding",
                        adapter_info.name
                    ),
                });
            }
        }
        let grid = g.network_side.max(g.depth) as u32;
        if grid > adapter_limits.max_compute_workgroups_per_dimension {
            return Err(EngineError::EngineUnavailable(format!(
                "adapter '{}' cannot dispatch {grid} workgroups per dimension",
                adapter_info.name
            )));
        }

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("separable_convolution"),
            source: wgpu::ShaderSource::Wgsl(shaders::SEPARABLE_CONVOLUTION.into()),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("separable_convolution_pipeline"),
            layout: None,
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });
        if let Some(error) = device.pop_error_scope().await {
            return Err(EngineError::EngineUnavailable(format!(
                "shader compilation failed: {error}"
            )));
        }

        let storage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let input = create_buffer(&device, "sepconv_input", sizes[0].1, storage);
        let vertical = create_buffer(&device, "sepconv_vertical", sizes[1].1, storage);
        let horizontal = create_buffer(&device, "sepconv_horizontal", sizes[2].1, storage);
        let output = create_buffer(
            &device,
            "sepconv_output",
            sizes[3].1,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        );
        let staging = create_buffer(
            &device,
            "sepconv_staging",
            sizes[3].1,
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        );
        let info = create_buffer(
            &device,
            "sepconv_info",
            std::mem::size_of::<ShaderInfo>() as u64,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        );
        let buffers = EngineBuffers {
            input,
            output,
            vertical,
            horizontal,
            info,
            staging,
        };
        if let Some(error) = device.pop_error_scope().await {
            let total: u64 = sizes.iter().map(|(_, b)| b).sum();
            return Err(EngineError::AllocationFailed {
                label: "engine",
                bytes: total,
                reason: error.to_string(),
            });
        }

        let layout = pipeline.get_bind_group_layout(0);
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("sepconv_bind_group"),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffers.input.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: buffers.output.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: buffers.vertical.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: buffers.horizontal.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: buffers.info.as_entire_binding(),
                },
            ],
        });

        Ok((
            GpuState {
                device,
                queue,
                pipeline,
                bind_group,
                buffers,
            },
            format!("{} ({:?})", adapter_info.name, adapter_info.backend),
        ))
    }
}

fn create_buffer(
    device: &wgpu::Device,
    label: &str,
    size: u64,
    usage: wgpu::BufferUsages,
) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage,
        mapped_at_creation: false,
    })
}

impl SeparableConvolution for GpuSeparableConvolution {
    fn name(&self) -> &str {
        "gpu"
    }

    fn geometry(&self) -> ConvolutionGeometry {
        self.geometry
    }

    fn prepare(&mut self) -> EngineResult<()> {
        if self.state.is_some() {
            return Ok(());
        }
        let started = Instant::now();
        let (state, adapter) = pollster::block_on(self.init())?;
        info!(
            adapter = %adapter,
            side = self.geometry.network_side,
            filter_length = self.geometry.filter_length,
            elapsed_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            "GPU convolution engine ready"
        );
        self.state = Some(state);
        self.adapter_name = Some(adapter);
        Ok(())
    }

    fn is_prepared(&self) -> bool {
        self.state.is_some()
    }

    fn apply(
        &mut self,
        input: &Tensor,
        vertical: &Tensor,
        horizontal: &Tensor,
    ) -> EngineResult<Tensor> {
        let state = self.state.as_ref().ok_or(EngineError::NotConfigured)?;
        let extent = validate_operands(&self.geometry, input, vertical, horizontal)?;
        let info = ShaderInfo::for_call(input, vertical, horizontal, &extent);
        let started = Instant::now();

        let buffers = &state.buffers;
        state
            .queue
            .write_buffer(&buffers.input, 0, bytemuck::cast_slice(input.as_slice()));
        state
            .queue
            .write_buffer(&buffers.vertical, 0, bytemuck::cast_slice(vertical.as_slice()));
        state.queue.write_buffer(
            &buffers.horizontal,
            0,
            bytemuck::cast_slice(horizontal.as_slice()),
        );
        state
            .queue
            .write_buffer(&buffers.info, 0, bytemuck::bytes_of(&info));

        let output_bytes = extent.output_len() as u64 * F32_SIZE;
        let mut encoder = state
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("sepconv_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("sepconv_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&state.pipeline);
            pass.set_bind_group(0, &state.bind_group, &[]);
            pass.dispatch_workgroups(
                extent.width as u32,
                extent.height as u32,
                extent.depth as u32,
            );
        }
        encoder.copy_buffer_to_buffer(&buffers.output, 0, &buffers.staging, 0, output_bytes);

        state.device.push_error_scope(wgpu::ErrorFilter::Validation);
        state.queue.submit(std::iter::once(encoder.finish()));
        if let Some(error) = pollster::block_on(state.device.pop_error_scope()) {
            return Err(EngineError::ExecutionFailed(error.to_string()));
        }

        let slice = buffers.staging.slice(..output_bytes);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        state.device.poll(wgpu::Maintain::Wait);

        rx.recv()
            .map_err(|_| EngineError::ExecutionFailed("map channel closed".into()))?
            .map_err(|e| EngineError::ExecutionFailed(format!("map failed: {e}")))?;

        let values: Vec<f32> = {
            let data = slice.get_mapped_range();
            bytemuck::cast_slice(&data).to_vec()
        };
        buffers.staging.unmap();

        debug!(
            width = extent.width,
            height = extent.height,
            gpu_ms = format!("{:.2}", started.elapsed().as_secs_f64() * 1000.0),
            "separable convolution dispatched"
        );

        Tensor::from_shape_vec(extent.output_shape(), values)
            .map_err(|e| EngineError::ExecutionFailed(format!("{e:#}")))
    }
}
