use {
    crate::{memory::AllocationUsage, pretty_wrappers::PrettyBitflag},
    ash::vk,
    thiserror::Error,
};

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("The logical device was lost")]
    DeviceLost,

    #[error("Out of host memory")]
    OutOfHostMemory,

    #[error("Out of device memory")]
    OutOfDeviceMemory,

    #[error("The swapchain is out of date")]
    SwapchainOutOfDate,

    #[error("The swapchain is suboptimal for the surface")]
    SwapchainSuboptimal,

    #[error("Required extension is missing: {0}")]
    ExtensionMissing(String),

    #[error("The descriptor pool is exhausted")]
    DescriptorPoolExhausted,

    #[error("A fence was scheduled after the loop was finalized")]
    FenceScheduleAfterFinalize,

    #[error("Allocation failed: {0}")]
    AllocationFailure(String),

    #[error("No memory type for bits {0} and usage {1:?}")]
    NoSupportedTypeForProperties(PrettyBitflag, AllocationUsage),

    #[error(transparent)]
    RuntimeError(#[from] anyhow::Error),
}

pub type RenderResult<T> = Result<T, RenderError>;

impl RenderError {
    /// True when the error cannot be recovered from without rebuilding the
    /// device.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RenderError::DeviceLost)
    }

    /// True for errors which only require the swapchain to be recreated.
    pub fn is_swapchain_stale(&self) -> bool {
        matches!(
            self,
            RenderError::SwapchainOutOfDate | RenderError::SwapchainSuboptimal
        )
    }
}

impl From<vk::Result> for RenderError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                RenderError::OutOfHostMemory
            }
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                RenderError::OutOfDeviceMemory
            }
            vk::Result::ERROR_OUT_OF_DATE_KHR => {
                RenderError::SwapchainOutOfDate
            }
            vk::Result::SUBOPTIMAL_KHR => RenderError::SwapchainSuboptimal,
            vk::Result::ERROR_FRAGMENTED_POOL
            | vk::Result::ERROR_OUT_OF_POOL_MEMORY => {
                RenderError::DescriptorPoolExhausted
            }
            vk::Result::ERROR_EXTENSION_NOT_PRESENT => {
                RenderError::ExtensionMissing(format!("{:?}", result))
            }
            other => RenderError::RuntimeError(anyhow::anyhow!(
                "Unexpected Vulkan result {:?}",
                other
            )),
        }
    }
}
