use candle_core::Device;
use std::error::Error;

/// Picks the first accelerator compiled in, falling back to the CPU.
pub fn get_device() -> Result<Device, Box<dyn Error>> {
    #[cfg(feature = "cuda")]
    if let Ok(device) = Device::cuda_if_available(0) {
        if device.is_cuda() {
            log::info!("Using CUDA");
            return Ok(device);
        }
    }
    #[cfg(feature = "metal")]
    if let Ok(device) = Device::new_metal(0) {
        if device.is_metal() {
            log::info!("Using Metal");
            return Ok(device);
        }
    }

    log::info!("Using CPU");
    Ok(Device::Cpu)
}
