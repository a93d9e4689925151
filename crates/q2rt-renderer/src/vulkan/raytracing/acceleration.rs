//! Acceleration structure management for ray tracing.
//!
//! `GeometryBuffers` uploads leaf meshes; `AccelerationStructureManager`
//! builds one BLAS per leaf from the uploaded buffers. The two share a
//! buffer table so they can be handed to the builder as the separate
//! resource and backend collaborators it expects.

use ash::khr::acceleration_structure;
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::rt_accel::{
    BlasHandle, IndexBufferHandle, RtAccelBackend, RtResourceFactory, VertexBufferHandle,
};
use crate::rt_local::Vertex3D;
use crate::vulkan::{Buffer, CommandContext, MemoryManager};

/// Bottom-level acceleration structure (BLAS).
pub struct Blas {
    pub handle: vk::AccelerationStructureKHR,
    pub buffer: Buffer,
    pub device_address: vk::DeviceAddress,
    pub primitive_count: u32,
}

#[derive(Default)]
struct BufferTable {
    buffers: HashMap<usize, Buffer>,
    next_id: usize,
}

impl BufferTable {
    fn insert(&mut self, buffer: Buffer) -> usize {
        self.next_id += 1;
        self.buffers.insert(self.next_id, buffer);
        self.next_id
    }

    fn address_of(&self, id: usize) -> Result<vk::DeviceAddress, String> {
        self.buffers
            .get(&id)
            .and_then(|b| b.device_address)
            .ok_or_else(|| format!("Unknown geometry buffer {}", id))
    }
}

/// Vertex/index buffer uploads for leaf meshes.
pub struct GeometryBuffers {
    memory: Arc<MemoryManager>,
    table: Arc<Mutex<BufferTable>>,
}

impl GeometryBuffers {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self {
            memory,
            table: Arc::new(Mutex::new(BufferTable::default())),
        }
    }

    unsafe fn upload<T: Copy>(&self, data: &[T], name: &str) -> Result<usize, String> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        let buffer = self.memory.create_buffer(
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::STORAGE_BUFFER,
            gpu_allocator::MemoryLocation::CpuToGpu,
            name,
        )?;
        buffer.write(data);
        Ok(self.table.lock().insert(buffer))
    }

    /// Destroy all uploaded buffers.
    pub unsafe fn destroy(&mut self) {
        let mut table = self.table.lock();
        for (_, buffer) in table.buffers.drain() {
            self.memory.destroy_buffer(buffer);
        }
    }
}

impl RtResourceFactory for GeometryBuffers {
    fn create_vertex_buffer(&mut self, vertices: &[Vertex3D]) -> Result<VertexBufferHandle, String> {
        if vertices.is_empty() {
            return Err("empty vertex data".to_string());
        }
        unsafe { self.upload(vertices, "leaf_vertices").map(VertexBufferHandle) }
    }

    fn create_index_buffer(&mut self, indices: &[u32]) -> Result<IndexBufferHandle, String> {
        if indices.is_empty() {
            return Err("empty index data".to_string());
        }
        unsafe { self.upload(indices, "leaf_indices").map(IndexBufferHandle) }
    }
}

/// Manages bottom-level acceleration structures.
pub struct AccelerationStructureManager {
    loader: acceleration_structure::Device,
    memory: Arc<MemoryManager>,
    commands: CommandContext,
    table: Arc<Mutex<BufferTable>>,
    blas_map: HashMap<BlasHandle, Blas>,
    scratch_buffer: Option<Buffer>,
    next_blas_id: usize,
}

impl AccelerationStructureManager {
    /// Create a new manager sharing `buffers`' uploads.
    ///
    /// # Safety
    /// `instance`/`device` must outlive the manager, and the device must
    /// have the acceleration-structure extension enabled.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        memory: Arc<MemoryManager>,
        commands: CommandContext,
        buffers: &GeometryBuffers,
    ) -> Result<Self, String> {
        let loader = acceleration_structure::Device::new(instance, device);

        Ok(Self {
            loader,
            memory,
            commands,
            table: buffers.table.clone(),
            blas_map: HashMap::new(),
            scratch_buffer: None,
            next_blas_id: 0,
        })
    }

    /// Get a BLAS by handle.
    pub fn get_blas(&self, handle: BlasHandle) -> Option<&Blas> {
        self.blas_map.get(&handle)
    }

    /// Ensure scratch buffer is at least the given size.
    unsafe fn ensure_scratch_buffer(&mut self, min_size: vk::DeviceSize) -> Result<(), String> {
        let needs_resize = match &self.scratch_buffer {
            Some(buf) => buf.size < min_size,
            None => true,
        };

        if needs_resize {
            if let Some(old) = self.scratch_buffer.take() {
                self.memory.destroy_buffer(old);
            }

            // Round up to power of 2 for reuse
            let size = min_size.next_power_of_two().max(1024 * 1024);

            self.scratch_buffer = Some(self.memory.create_buffer(
                size,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                gpu_allocator::MemoryLocation::GpuOnly,
                "as_scratch",
            )?);
        }

        Ok(())
    }

    unsafe fn build_blas_triangles(
        &mut self,
        vertex_address: vk::DeviceAddress,
        vertex_count: u32,
        index_address: vk::DeviceAddress,
        index_count: u32,
    ) -> Result<BlasHandle, String> {
        let triangle_count = index_count / 3;

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: vertex_address,
            })
            .vertex_stride(Vertex3D::SIZE as vk::DeviceSize)
            .max_vertex(vertex_count)
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: index_address,
            });

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(vk::GeometryFlagsKHR::OPAQUE);

        let geometries = [geometry];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let primitive_counts = [triangle_count];
        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        self.loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &primitive_counts,
            &mut size_info,
        );

        // Create acceleration structure buffer
        let as_buffer = self.memory.create_buffer(
            size_info.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            gpu_allocator::MemoryLocation::GpuOnly,
            "blas_buffer",
        )?;

        let as_create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(as_buffer.handle)
            .size(size_info.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);

        let handle = self
            .loader
            .create_acceleration_structure(&as_create_info, None)
            .map_err(|e| format!("Failed to create BLAS: {:?}", e))?;

        let addr_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        let device_address = self.loader.get_acceleration_structure_device_address(&addr_info);

        self.ensure_scratch_buffer(size_info.build_scratch_size)?;
        let scratch_address = self.scratch_buffer.as_ref().unwrap().device_address.unwrap();

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(handle)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });

        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(triangle_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0);

        let build_ranges: &[vk::AccelerationStructureBuildRangeInfoKHR] = &[build_range];

        // Record and submit the build, blocking until the GPU is done —
        // all builds are serialized onto the one submission context.
        let cmd = self.commands.begin_single_time()?;
        self.loader
            .cmd_build_acceleration_structures(cmd, &[build_info], &[build_ranges]);
        self.commands.end_single_time(cmd)?;

        let blas_handle = BlasHandle(self.next_blas_id);
        self.next_blas_id += 1;

        self.blas_map.insert(
            blas_handle,
            Blas {
                handle,
                buffer: as_buffer,
                device_address,
                primitive_count: triangle_count,
            },
        );

        Ok(blas_handle)
    }

    /// Destroy all acceleration structures.
    pub unsafe fn destroy(&mut self) {
        for (_, blas) in self.blas_map.drain() {
            self.loader.destroy_acceleration_structure(blas.handle, None);
            self.memory.destroy_buffer(blas.buffer);
        }
        if let Some(scratch) = self.scratch_buffer.take() {
            self.memory.destroy_buffer(scratch);
        }
        self.commands.destroy();
    }
}

impl RtAccelBackend for AccelerationStructureManager {
    fn build_blas(
        &mut self,
        vertices: VertexBufferHandle,
        vertex_count: u32,
        indices: IndexBufferHandle,
        index_count: u32,
    ) -> Result<BlasHandle, String> {
        let (vertex_address, index_address) = {
            let table = self.table.lock();
            (table.address_of(vertices.0)?, table.address_of(indices.0)?)
        };
        unsafe { self.build_blas_triangles(vertex_address, vertex_count, index_address, index_count) }
    }
}
