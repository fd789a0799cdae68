use std::fmt;
use tracing::info;

pub fn system_info() -> anyhow::Result<()> {
    info!("System Information:");
    info!("{}", CpuInfo::detect());
    gpu_info(true)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct CpuInfo {
    pub vendor: String,
    pub brand: String,
    pub physical_cores: usize,
    pub logical_cores: usize,
}

impl CpuInfo {
    pub fn detect() -> Self {
        use raw_cpuid::CpuId;
        let cpuid = CpuId::new();
        Self {
            vendor: cpuid
                .get_vendor_info()
                .map(|v| v.as_str().to_owned())
                .unwrap_or_else(|| "Unknown".to_owned()),
            brand: cpuid
                .get_processor_brand_string()
                .map(|b| b.as_str().trim().to_owned())
                .unwrap_or_else(|| "Unknown".to_owned()),
            physical_cores: num_cpus::get_physical(),
            logical_cores: num_cpus::get(),
        }
    }
}

impl fmt::Display for CpuInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CPU | {} | {} | {} Cores | {} Logical Cores",
            self.vendor, self.brand, self.physical_cores, self.logical_cores
        )
    }
}

#[cfg(not(windows))]
pub fn gpu_info(_log_info: bool) -> anyhow::Result<Vec<String>> {
    Ok(vec![])
}

#[cfg(windows)]
pub fn gpu_info(log_info: bool) -> anyhow::Result<Vec<String>> {
    use windows::Win32::Graphics::Dxgi::{CreateDXGIFactory1, DXGI_ADAPTER_DESC1, IDXGIFactory1};
    let factory: IDXGIFactory1 = unsafe { CreateDXGIFactory1()? };
    let mut adapter_index = 0;
    let mut gpu_names = Vec::new();

    while let Ok(adapter) = unsafe { factory.EnumAdapters1(adapter_index) } {
        let desc: DXGI_ADAPTER_DESC1 = unsafe { adapter.GetDesc1()? };
        let device_name = String::from_utf16_lossy(&desc.Description)
            .replace('\0', "")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        // Skips the software rasterizer
        if !device_name.contains("Microsoft") && !gpu_names.contains(&device_name) {
            gpu_names.push(device_name);
        }
        adapter_index += 1;
    }

    gpu_names.sort();
    if log_info {
        for (index, device_name) in gpu_names.iter().enumerate() {
            info!("GPU {} | {}", index, device_name);
        }
    }

    Ok(gpu_names)
}
