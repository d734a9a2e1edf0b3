use std::{collections::HashMap, sync::mpsc};

use num_complex::Complex;
use tracing::{debug, info};
use wgpu::util::DeviceExt;

use super::{Backend, BufferShape, KetKind, Shader};
use crate::{
    error::{Result, SimError},
    pool::Buffer,
};

const WORKGROUP_SIZE: u32 = 64;
const MAX_GROUPS_PER_DIMENSION: u32 = 65535;
const F32_SIZE: u64 = size_of::<f32>() as u64;

const ENTRY_POINTS: [&str; 13] = [
    "fill",
    "basis",
    "control_bit",
    "product",
    "ket_matrix",
    "ket_matrix_1",
    "ket_permutation",
    "ket_phase",
    "ket_offset",
    "swap",
    "density_terms",
    "probability_terms",
    "fold_sum",
];

/// A buffer living on the device.
pub struct GpuStorage {
    buffer: wgpu::Buffer,
    floats: usize,
}

/// Evaluates shaders as `wgpu` compute kernels, one invocation per texel.
pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    bind_group_layout: wgpu::BindGroupLayout,
    pipelines: HashMap<&'static str, wgpu::ComputePipeline>,
    /// Bound wherever a kernel has no use for a binding.
    placeholder: wgpu::Buffer,
}

impl GpuBackend {
    pub async fn new() -> Result<GpuBackend> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .ok_or_else(|| SimError::Gpu("no suitable adapter".to_string()))?;
        let adapter_info = adapter.get_info();
        info!(
            name = %adapter_info.name,
            backend = ?adapter_info.backend,
            "Using GPU adapter"
        );
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default(), None)
            .await
            .map_err(|e| SimError::Gpu(e.to_string()))?;

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Shader"),
            entries: &[
                layout_entry(0, wgpu::BufferBindingType::Uniform),
                layout_entry(1, wgpu::BufferBindingType::Storage { read_only: true }),
                layout_entry(2, wgpu::BufferBindingType::Storage { read_only: true }),
                layout_entry(3, wgpu::BufferBindingType::Storage { read_only: true }),
                layout_entry(4, wgpu::BufferBindingType::Storage { read_only: false }),
            ],
        });
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Kernels"),
            source: wgpu::ShaderSource::Wgsl(include_str!("gpu/kernels.wgsl").into()),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Shader"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipelines = ENTRY_POINTS
            .into_iter()
            .map(|entry_point| {
                let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(entry_point),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: Some(entry_point),
                    cache: None,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                });
                (entry_point, pipeline)
            })
            .collect();

        let placeholder = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Placeholder"),
            size: 4 * F32_SIZE,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        Ok(GpuBackend {
            device,
            queue,
            bind_group_layout,
            pipelines,
            placeholder,
        })
    }

    fn pipeline(&self, entry_point: &str) -> Result<&wgpu::ComputePipeline> {
        self.pipelines
            .get(entry_point)
            .ok_or_else(|| SimError::Gpu(format!("no kernel named {entry_point}")))
    }
}

fn layout_entry(binding: u32, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Mirrors `Params` in the kernels.
#[derive(Default)]
struct Params {
    texel_count: u32,
    row_stride: u32,
    channels: u32,
    row: u32,
    span: u32,
    args: [u32; 3],
    value: [f32; 4],
}
impl Params {
    fn to_bytes(&self) -> Vec<u8> {
        let words = [
            self.texel_count,
            self.row_stride,
            self.channels,
            self.row,
            self.span,
            self.args[0],
            self.args[1],
            self.args[2],
        ];
        words
            .iter()
            .flat_map(|w| w.to_ne_bytes())
            .chain(self.value.iter().flat_map(|v| v.to_ne_bytes()))
            .collect()
    }
}

/// Everything one dispatch needs besides the target.
struct Dispatch<'r> {
    entry_point: &'static str,
    params: Params,
    src: Option<&'r wgpu::Buffer>,
    ctl: Option<&'r wgpu::Buffer>,
    coefs: Vec<f32>,
}

fn flatten(values: &[Complex<f32>]) -> Vec<f32> {
    values.iter().flat_map(|c| [c.re, c.im]).collect()
}

fn storage_buffer<'r>(buffer: &'r Buffer<GpuBackend>) -> Result<&'r wgpu::Buffer> {
    buffer.storage().map(|s| &s.buffer)
}

impl<'r> Dispatch<'r> {
    fn resolve(
        shader: &'r Shader<'_, GpuBackend>,
        input: Option<&'r GpuStorage>,
    ) -> Result<Self> {
        let input = || {
            input
                .map(|s| &s.buffer)
                .ok_or(SimError::MissingInput(shader.name()))
        };
        let plain = |entry_point| Dispatch {
            entry_point,
            params: Params::default(),
            src: None,
            ctl: None,
            coefs: Vec::new(),
        };
        Ok(match shader {
            Shader::Uniform(value) => Dispatch {
                params: Params {
                    value: *value,
                    ..Params::default()
                },
                ..plain("fill")
            },
            Shader::Basis { index } => Dispatch {
                params: Params {
                    args: [u32::try_from(*index).unwrap_or(u32::MAX), 0, 0],
                    ..Params::default()
                },
                ..plain("basis")
            },
            Shader::ControlBit { bit, desired } => Dispatch {
                params: Params {
                    args: [*bit, u32::from(*desired), 0],
                    ..Params::default()
                },
                ..plain("control_bit")
            },
            Shader::Product { other } => Dispatch {
                src: Some(input()?),
                ctl: Some(storage_buffer(other)?),
                ..plain("product")
            },
            Shader::Ket { control, row, kind } => {
                let (entry_point, args, coefs) = match kind {
                    KetKind::Matrix { span, coefficients } => {
                        let entry_point = if *span == 1 {
                            "ket_matrix_1"
                        } else {
                            "ket_matrix"
                        };
                        (entry_point, [0; 3], flatten(coefficients))
                    }
                    KetKind::Permutation { sources, .. } => (
                        "ket_permutation",
                        [0; 3],
                        sources.iter().map(|&s| s as f32).collect(),
                    ),
                    KetKind::Phase { factors, .. } => ("ket_phase", [0; 3], flatten(factors)),
                    KetKind::Offset {
                        input_offset,
                        input_length,
                        sign,
                        ..
                    } => (
                        "ket_offset",
                        [*input_offset, *input_length, u32::from(*sign >= 0)],
                        Vec::new(),
                    ),
                };
                Dispatch {
                    entry_point,
                    params: Params {
                        row: *row,
                        span: kind.span(),
                        args,
                        ..Params::default()
                    },
                    src: Some(input()?),
                    ctl: Some(storage_buffer(control)?),
                    coefs,
                }
            }
            Shader::Swap {
                control,
                bit_a,
                bit_b,
            } => Dispatch {
                params: Params {
                    args: [*bit_a, *bit_b, 0],
                    ..Params::default()
                },
                src: Some(input()?),
                ctl: Some(storage_buffer(control)?),
                ..plain("swap")
            },
            Shader::DensityTerms { control, row, span } => Dispatch {
                params: Params {
                    row: *row,
                    span: *span,
                    ..Params::default()
                },
                src: Some(input()?),
                ctl: Some(storage_buffer(control)?),
                ..plain("density_terms")
            },
            Shader::ProbabilityTerms {
                control,
                row,
                span,
                amplitudes,
            } => Dispatch {
                params: Params {
                    row: *row,
                    span: *span,
                    args: [u32::from(*amplitudes), 0, 0],
                    ..Params::default()
                },
                src: Some(input()?),
                ctl: Some(storage_buffer(control)?),
                ..plain("probability_terms")
            },
            Shader::FoldSum => Dispatch {
                src: Some(input()?),
                ..plain("fold_sum")
            },
        })
    }
}

impl Backend for GpuBackend {
    type Storage = GpuStorage;

    fn name(&self) -> &'static str {
        "gpu"
    }

    fn allocate(&self, shape: BufferShape) -> Result<GpuStorage> {
        let floats = shape.float_count();
        let size = floats as u64 * F32_SIZE;
        let max = self.device.limits().max_storage_buffer_binding_size as u64;
        if size > max {
            return Err(SimError::Gpu(format!(
                "buffer of {size} bytes exceeds the binding limit of {max}"
            )));
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Texels"),
            size: size.max(F32_SIZE),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(GpuStorage { buffer, floats })
    }

    fn render(
        &self,
        shader: &Shader<'_, Self>,
        input: Option<&GpuStorage>,
        shape: BufferShape,
        target: &mut GpuStorage,
    ) -> Result<()> {
        let mut dispatch = Dispatch::resolve(shader, input)?;
        let pipeline = self.pipeline(dispatch.entry_point)?;

        let texels = u32::try_from(shape.texel_count())
            .map_err(|_| SimError::Gpu("too many texels for one dispatch".to_string()))?;
        let groups = texels.div_ceil(WORKGROUP_SIZE);
        let groups_x = groups.min(MAX_GROUPS_PER_DIMENSION);
        let groups_y = groups.div_ceil(groups_x);
        dispatch.params.texel_count = texels;
        dispatch.params.row_stride = groups_x * WORKGROUP_SIZE;
        dispatch.params.channels = shape.pixel_type().channels() as u32;

        let params_buf = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Params"),
                contents: &dispatch.params.to_bytes(),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let coefs_buf = (!dispatch.coefs.is_empty()).then(|| {
            let contents: Vec<u8> = dispatch.coefs.iter().flat_map(|c| c.to_ne_bytes()).collect();
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("Coefficients"),
                    contents: &contents,
                    usage: wgpu::BufferUsages::STORAGE,
                })
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(dispatch.entry_point),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: dispatch.src.unwrap_or(&self.placeholder).as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: dispatch.ctl.unwrap_or(&self.placeholder).as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: coefs_buf
                        .as_ref()
                        .unwrap_or(&self.placeholder)
                        .as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: target.buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut compute_pass =
                encoder.begin_compute_pass(&wgpu::ComputePassDescriptor::default());
            compute_pass.set_pipeline(pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            compute_pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_pixels(&self, storage: &GpuStorage, shape: BufferShape) -> Result<Vec<f32>> {
        if storage.floats != shape.float_count() {
            return Err(SimError::dimension_mismatch(
                "read pixels",
                shape.float_count(),
                storage.floats,
            ));
        }
        let size = storage.floats as u64 * F32_SIZE;
        if size == 0 {
            return Ok(Vec::new());
        }
        let download_buf = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Download"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&storage.buffer, 0, &download_buf, 0, size);
        self.queue.submit([encoder.finish()]);

        let slice = download_buf.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            // The receiver only goes away if reading already failed.
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|e| SimError::Gpu(e.to_string()))?
            .map_err(|e| SimError::Gpu(e.to_string()))?;

        let pixels = {
            let data = slice.get_mapped_range();
            data.chunks_exact(4)
                .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        };
        download_buf.unmap();
        debug!(floats = storage.floats, "Read pixels from GPU");
        Ok(pixels)
    }
}
