use sysinfo::{CpuExt, System, SystemExt};

// sysinfo reports memory in bytes.
const BYTES_PER_GIB: f32 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug)]
pub struct SystemResources {
    sys: System,
    pub os: Option<String>,
    pub cpu_brand: String,
    pub cpu_core_count: usize,
    pub cpu_load_avg_one: f32,
    pub ram_total_gb: f32,
    pub ram_used_gb: f32,
    pub ram_available_gb: f32,
    pub swap_total_gb: f32,
    pub swap_used_gb: f32,
}

impl SystemResources {
    pub fn new() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let os = sys.long_os_version();
        let cpu_brand = sys.global_cpu_info().brand().trim().to_string();
        let cpu_core_count = sys.cpus().len();

        let mut resources = Self {
            sys,
            os,
            cpu_brand,
            cpu_core_count,
            cpu_load_avg_one: 0.0,
            ram_total_gb: 0.0,
            ram_used_gb: 0.0,
            ram_available_gb: 0.0,
            swap_total_gb: 0.0,
            swap_used_gb: 0.0,
        };
        resources.read_counters();
        resources
    }

    pub fn refresh(&mut self) {
        self.sys.refresh_memory();
        self.sys.refresh_cpu();
        self.read_counters();
    }

    fn read_counters(&mut self) {
        self.cpu_load_avg_one = self.sys.load_average().one as f32;
        self.ram_total_gb = self.sys.total_memory() as f32 / BYTES_PER_GIB;
        self.ram_used_gb = self.sys.used_memory() as f32 / BYTES_PER_GIB;
        self.ram_available_gb = self.sys.available_memory() as f32 / BYTES_PER_GIB;
        self.swap_total_gb = self.sys.total_swap() as f32 / BYTES_PER_GIB;
        self.swap_used_gb = self.sys.used_swap() as f32 / BYTES_PER_GIB;
    }
}

impl Default for SystemResources {
    fn default() -> Self {
        Self::new()
    }
}
