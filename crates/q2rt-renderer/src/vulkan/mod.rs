//! Vulkan backend for the map pipeline.
//!
//! Buffer allocation goes through gpu-allocator; acceleration-structure
//! builds live in `raytracing`. Instance/device/queue creation belongs to
//! the host application — everything here takes existing handles.

pub mod raytracing;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

/// GPU buffer with associated memory.
pub struct Buffer {
    pub handle: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub device_address: Option<vk::DeviceAddress>,
}

impl Buffer {
    /// Map the buffer memory for CPU access.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr() as *mut u8)
    }

    /// Write data to the buffer.
    ///
    /// # Safety
    /// Buffer must be mappable and data must fit.
    pub unsafe fn write<T: Copy>(&self, data: &[T]) {
        if let Some(ptr) = self.mapped_ptr() {
            std::ptr::copy_nonoverlapping(
                data.as_ptr() as *const u8,
                ptr,
                std::mem::size_of_val(data),
            );
        }
    }
}

/// Memory manager wrapping gpu-allocator.
pub struct MemoryManager {
    allocator: Arc<Mutex<Allocator>>,
    device: ash::Device,
}

impl MemoryManager {
    /// Create a new memory manager over an existing device.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        buffer_device_address: bool,
    ) -> Result<Self, String> {
        let mut debug_settings = gpu_allocator::AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings,
            buffer_device_address,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| format!("Failed to create allocator: {:?}", e))?;

        Ok(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            device: device.clone(),
        })
    }

    /// Create a buffer with the specified usage and memory location.
    pub unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Buffer, String> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = self
            .device
            .create_buffer(&buffer_info, None)
            .map_err(|e| format!("Failed to create buffer: {:?}", e))?;

        let requirements = self.device.get_buffer_memory_requirements(handle);

        let allocation = self
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| format!("Failed to allocate buffer memory: {:?}", e))?;

        self.device
            .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
            .map_err(|e| format!("Failed to bind buffer memory: {:?}", e))?;

        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let addr_info = vk::BufferDeviceAddressInfo::default().buffer(handle);
            Some(self.device.get_buffer_device_address(&addr_info))
        } else {
            None
        };

        Ok(Buffer {
            handle,
            allocation: Some(allocation),
            size,
            usage,
            device_address,
        })
    }

    /// Destroy a buffer and free its memory.
    pub unsafe fn destroy_buffer(&self, mut buffer: Buffer) {
        if let Some(allocation) = buffer.allocation.take() {
            let _ = self.allocator.lock().free(allocation);
        }
        self.device.destroy_buffer(buffer.handle, None);
    }
}

/// One-shot command submission. All GPU work in the pipeline is serialized
/// onto a single queue with a blocking wait — map loading is not
/// latency-sensitive.
pub struct CommandContext {
    device: ash::Device,
    queue: vk::Queue,
    transient_pool: vk::CommandPool,
}

impl CommandContext {
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        queue: vk::Queue,
    ) -> Result<Self, String> {
        let transient_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let transient_pool = device
            .create_command_pool(&transient_info, None)
            .map_err(|e| format!("Failed to create transient pool: {:?}", e))?;

        Ok(Self {
            device: device.clone(),
            queue,
            transient_pool,
        })
    }

    /// Begin recording a single-use command buffer.
    pub unsafe fn begin_single_time(&self) -> Result<vk::CommandBuffer, String> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.transient_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = self
            .device
            .allocate_command_buffers(&alloc_info)
            .map_err(|e| format!("Failed to allocate command buffer: {:?}", e))?[0];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        self.device
            .begin_command_buffer(cmd, &begin_info)
            .map_err(|e| format!("Failed to begin command buffer: {:?}", e))?;

        Ok(cmd)
    }

    /// End and submit a single-use command buffer, waiting for completion.
    pub unsafe fn end_single_time(&self, cmd: vk::CommandBuffer) -> Result<(), String> {
        self.device
            .end_command_buffer(cmd)
            .map_err(|e| format!("Failed to end command buffer: {:?}", e))?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);

        self.device
            .queue_submit(self.queue, &[submit_info], vk::Fence::null())
            .map_err(|e| format!("Failed to submit command buffer: {:?}", e))?;

        self.device
            .queue_wait_idle(self.queue)
            .map_err(|e| format!("Failed to wait for queue: {:?}", e))?;

        self.device
            .free_command_buffers(self.transient_pool, &command_buffers);

        Ok(())
    }

    pub unsafe fn destroy(&mut self) {
        self.device.destroy_command_pool(self.transient_pool, None);
    }
}
