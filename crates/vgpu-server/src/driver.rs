//! The vendor accelerator boundary.
//!
//! The worker never calls a vendor API directly; it goes through
//! `AcceleratorDriver`, a narrow trait over the foreign-call surface the
//! pipeline needs. Vendor calls may succeed, fail with a vendor error code,
//! or hang; the core only wraps and sequences them. `SimDriver` implements
//! the trait over host memory and is the default when no real accelerator
//! binding is configured.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

pub type DevicePtr = u64;
pub type StreamHandle = u64;
pub type EventHandle = u64;
pub type ModuleHandle = u64;
pub type FunctionHandle = u64;
pub type BlasHandle = u64;

/// Vendor calls return their own integer error space; the runtime passes
/// codes through to the guest unaltered.
pub type VendorResult<T> = Result<T, i32>;

pub const VENDOR_ERR_INVALID_VALUE: i32 = 1;
pub const VENDOR_ERR_OUT_OF_MEMORY: i32 = 2;
pub const VENDOR_ERR_NOT_INITIALIZED: i32 = 3;
pub const VENDOR_ERR_INVALID_HANDLE: i32 = 400;
pub const VENDOR_ERR_NOT_FOUND: i32 = 500;

/// The legacy default stream.
pub const STREAM_DEFAULT: StreamHandle = 0;

#[derive(Debug, Clone, Copy)]
pub struct LaunchConfig {
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub shared_mem: u32,
    pub stream: StreamHandle,
}

#[derive(Debug, Clone, Copy)]
pub struct SgemmDesc {
    pub m: u32,
    pub n: u32,
    pub k: u32,
    pub a: DevicePtr,
    pub b: DevicePtr,
    pub c: DevicePtr,
}

pub trait AcceleratorDriver: Send + Sync {
    fn device_count(&self) -> VendorResult<i32>;
    fn set_device(&self, ordinal: i32) -> VendorResult<()>;
    fn device_synchronize(&self) -> VendorResult<()>;
    fn primary_ctx_state(&self, ordinal: i32) -> VendorResult<(u32, i32)>;

    fn mem_alloc(&self, size: u64) -> VendorResult<DevicePtr>;
    /// Allocation on an explicit device; migration uses this for the
    /// destination-side buffers.
    fn mem_alloc_on(&self, ordinal: i32, size: u64) -> VendorResult<DevicePtr>;
    fn mem_free(&self, ptr: DevicePtr) -> VendorResult<()>;
    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> VendorResult<()>;
    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> VendorResult<()>;
    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, len: u64) -> VendorResult<()>;
    fn memcpy_htod_async(&self, dst: DevicePtr, src: &[u8], stream: StreamHandle) -> VendorResult<()>;
    fn memcpy_dtoh_async(&self, dst: &mut [u8], src: DevicePtr, stream: StreamHandle) -> VendorResult<()>;
    fn memcpy_dtod_async(&self, dst: DevicePtr, src: DevicePtr, len: u64, stream: StreamHandle) -> VendorResult<()>;
    fn memcpy_peer_async(
        &self,
        dst: DevicePtr,
        dst_device: i32,
        src: DevicePtr,
        src_device: i32,
        len: u64,
        stream: StreamHandle,
    ) -> VendorResult<()>;

    fn stream_create(&self) -> VendorResult<StreamHandle>;
    fn stream_destroy(&self, stream: StreamHandle) -> VendorResult<()>;
    fn stream_synchronize(&self, stream: StreamHandle) -> VendorResult<()>;

    fn event_create(&self, flags: u32) -> VendorResult<EventHandle>;
    fn event_destroy(&self, event: EventHandle) -> VendorResult<()>;
    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> VendorResult<()>;

    fn module_load(&self, image: &[u8]) -> VendorResult<ModuleHandle>;
    fn module_unload(&self, module: ModuleHandle) -> VendorResult<()>;
    fn module_get_function(&self, module: ModuleHandle, name: &str) -> VendorResult<FunctionHandle>;
    fn module_get_global(&self, module: ModuleHandle, name: &str) -> VendorResult<(DevicePtr, u64)>;
    fn launch_kernel(&self, func: FunctionHandle, cfg: &LaunchConfig, args: &[u8]) -> VendorResult<()>;

    fn blas_create(&self) -> VendorResult<BlasHandle>;
    fn blas_destroy(&self, handle: BlasHandle) -> VendorResult<()>;
    fn blas_set_stream(&self, handle: BlasHandle, stream: StreamHandle) -> VendorResult<()>;
    fn blas_set_math_mode(&self, handle: BlasHandle, mode: u32) -> VendorResult<()>;
    fn blas_sgemm(&self, handle: BlasHandle, desc: &SgemmDesc) -> VendorResult<()>;

    fn last_error(&self) -> i32;
    fn error_string(&self, code: i32) -> String;
}

struct SimAlloc {
    device: i32,
    data: Mutex<Vec<u8>>,
}

struct SimModule {
    /// Entry names parsed out of the image; empty means the image is opaque
    /// and any lookup succeeds.
    symbols: Vec<String>,
}

/// In-process accelerator: a flat device address space over host memory,
/// enough devices for peer copies, and no-op kernels. The pipeline-visible
/// contracts (addresses, sizes, error codes, stream/event identity) are
/// honored; compute is not.
pub struct SimDriver {
    nb_devices: i32,
    allocs: RwLock<BTreeMap<DevicePtr, SimAlloc>>,
    next_ptr: AtomicU64,
    streams: DashMap<StreamHandle, ()>,
    next_stream: AtomicU64,
    events: DashMap<EventHandle, ()>,
    next_event: AtomicU64,
    modules: DashMap<ModuleHandle, SimModule>,
    next_module: AtomicU64,
    functions: DashMap<FunctionHandle, (ModuleHandle, String)>,
    next_function: AtomicU64,
    globals: DashMap<(ModuleHandle, String), DevicePtr>,
    blas: DashMap<BlasHandle, ()>,
    next_blas: AtomicU64,
    launches: DashMap<FunctionHandle, u64>,
    current_device: AtomicI32,
    last_error: AtomicI32,
}

impl SimDriver {
    pub fn new() -> Self {
        Self::with_devices(2)
    }

    pub fn with_devices(nb_devices: i32) -> Self {
        Self {
            nb_devices,
            allocs: RwLock::new(BTreeMap::new()),
            next_ptr: AtomicU64::new(0x7000_0000_0000),
            streams: DashMap::new(),
            next_stream: AtomicU64::new(1),
            events: DashMap::new(),
            next_event: AtomicU64::new(1),
            modules: DashMap::new(),
            next_module: AtomicU64::new(1),
            functions: DashMap::new(),
            next_function: AtomicU64::new(1),
            globals: DashMap::new(),
            blas: DashMap::new(),
            next_blas: AtomicU64::new(1),
            launches: DashMap::new(),
            current_device: AtomicI32::new(0),
            last_error: AtomicI32::new(0),
        }
    }

    /// Launches observed per function; tests assert dispatch happened.
    pub fn launch_count(&self, func: FunctionHandle) -> u64 {
        self.launches.get(&func).map(|c| *c).unwrap_or(0)
    }

    fn fail(&self, code: i32) -> i32 {
        self.last_error.store(code, Ordering::Relaxed);
        code
    }

    /// Copy `len` bytes out of the allocation containing `src`.
    fn read(&self, src: DevicePtr, dst: &mut [u8]) -> VendorResult<()> {
        let allocs = self.allocs.read();
        let (&base, alloc) = allocs
            .range(..=src)
            .next_back()
            .ok_or_else(|| self.fail(VENDOR_ERR_INVALID_VALUE))?;
        let data = alloc.data.lock();
        let offset = (src - base) as usize;
        if offset + dst.len() > data.len() {
            return Err(self.fail(VENDOR_ERR_INVALID_VALUE));
        }
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
        Ok(())
    }

    fn write(&self, dst: DevicePtr, src: &[u8]) -> VendorResult<()> {
        let allocs = self.allocs.read();
        let (&base, alloc) = allocs
            .range(..=dst)
            .next_back()
            .ok_or_else(|| self.fail(VENDOR_ERR_INVALID_VALUE))?;
        let mut data = alloc.data.lock();
        let offset = (dst - base) as usize;
        if offset + src.len() > data.len() {
            return Err(self.fail(VENDOR_ERR_INVALID_VALUE));
        }
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Entry names are any `_Z`-prefixed printable tokens in the image.
    fn parse_symbols(image: &[u8]) -> Vec<String> {
        let mut symbols = Vec::new();
        for token in image.split(|&b| b == 0 || b == b'\n' || b == b' ') {
            if token.starts_with(b"_Z") {
                if let Ok(name) = std::str::from_utf8(token) {
                    symbols.push(name.to_string());
                }
            }
        }
        symbols
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceleratorDriver for SimDriver {
    fn device_count(&self) -> VendorResult<i32> {
        Ok(self.nb_devices)
    }

    fn set_device(&self, ordinal: i32) -> VendorResult<()> {
        if ordinal < 0 || ordinal >= self.nb_devices {
            return Err(self.fail(VENDOR_ERR_INVALID_VALUE));
        }
        self.current_device.store(ordinal, Ordering::Relaxed);
        Ok(())
    }

    fn device_synchronize(&self) -> VendorResult<()> {
        Ok(())
    }

    fn primary_ctx_state(&self, ordinal: i32) -> VendorResult<(u32, i32)> {
        if ordinal < 0 || ordinal >= self.nb_devices {
            return Err(self.fail(VENDOR_ERR_INVALID_VALUE));
        }
        Ok((0, 1))
    }

    fn mem_alloc(&self, size: u64) -> VendorResult<DevicePtr> {
        self.mem_alloc_on(self.current_device.load(Ordering::Relaxed), size)
    }

    fn mem_alloc_on(&self, ordinal: i32, size: u64) -> VendorResult<DevicePtr> {
        if ordinal < 0 || ordinal >= self.nb_devices {
            return Err(self.fail(VENDOR_ERR_INVALID_VALUE));
        }
        if size == 0 {
            return Err(self.fail(VENDOR_ERR_INVALID_VALUE));
        }
        let step = size.div_ceil(0x1000).max(1) * 0x1000;
        let ptr = self.next_ptr.fetch_add(step, Ordering::Relaxed);
        self.allocs.write().insert(
            ptr,
            SimAlloc { device: ordinal, data: Mutex::new(vec![0; size as usize]) },
        );
        Ok(ptr)
    }

    fn mem_free(&self, ptr: DevicePtr) -> VendorResult<()> {
        match self.allocs.write().remove(&ptr) {
            Some(_) => Ok(()),
            None => Err(self.fail(VENDOR_ERR_INVALID_VALUE)),
        }
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> VendorResult<()> {
        self.write(dst, src)
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> VendorResult<()> {
        self.read(src, dst)
    }

    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, len: u64) -> VendorResult<()> {
        let mut buf = vec![0u8; len as usize];
        self.read(src, &mut buf)?;
        self.write(dst, &buf)
    }

    fn memcpy_htod_async(&self, dst: DevicePtr, src: &[u8], _stream: StreamHandle) -> VendorResult<()> {
        self.write(dst, src)
    }

    fn memcpy_dtoh_async(&self, dst: &mut [u8], src: DevicePtr, _stream: StreamHandle) -> VendorResult<()> {
        self.read(src, dst)
    }

    fn memcpy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        len: u64,
        _stream: StreamHandle,
    ) -> VendorResult<()> {
        self.memcpy_dtod(dst, src, len)
    }

    fn memcpy_peer_async(
        &self,
        dst: DevicePtr,
        dst_device: i32,
        src: DevicePtr,
        src_device: i32,
        len: u64,
        _stream: StreamHandle,
    ) -> VendorResult<()> {
        {
            let allocs = self.allocs.read();
            let src_dev = allocs.range(..=src).next_back().map(|(_, a)| a.device);
            let dst_dev = allocs.range(..=dst).next_back().map(|(_, a)| a.device);
            if src_dev != Some(src_device) || dst_dev != Some(dst_device) {
                return Err(self.fail(VENDOR_ERR_INVALID_VALUE));
            }
        }
        self.memcpy_dtod(dst, src, len)
    }

    fn stream_create(&self) -> VendorResult<StreamHandle> {
        let stream = self.next_stream.fetch_add(1, Ordering::Relaxed);
        self.streams.insert(stream, ());
        Ok(stream)
    }

    fn stream_destroy(&self, stream: StreamHandle) -> VendorResult<()> {
        match self.streams.remove(&stream) {
            Some(_) => Ok(()),
            None => Err(self.fail(VENDOR_ERR_INVALID_HANDLE)),
        }
    }

    fn stream_synchronize(&self, stream: StreamHandle) -> VendorResult<()> {
        if stream != STREAM_DEFAULT && !self.streams.contains_key(&stream) {
            return Err(self.fail(VENDOR_ERR_INVALID_HANDLE));
        }
        Ok(())
    }

    fn event_create(&self, _flags: u32) -> VendorResult<EventHandle> {
        let event = self.next_event.fetch_add(1, Ordering::Relaxed);
        self.events.insert(event, ());
        Ok(event)
    }

    fn event_destroy(&self, event: EventHandle) -> VendorResult<()> {
        match self.events.remove(&event) {
            Some(_) => Ok(()),
            None => Err(self.fail(VENDOR_ERR_INVALID_HANDLE)),
        }
    }

    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> VendorResult<()> {
        if !self.events.contains_key(&event) {
            return Err(self.fail(VENDOR_ERR_INVALID_HANDLE));
        }
        self.stream_synchronize(stream)
    }

    fn module_load(&self, image: &[u8]) -> VendorResult<ModuleHandle> {
        if image.is_empty() {
            return Err(self.fail(VENDOR_ERR_INVALID_VALUE));
        }
        let module = self.next_module.fetch_add(1, Ordering::Relaxed);
        self.modules.insert(module, SimModule { symbols: Self::parse_symbols(image) });
        Ok(module)
    }

    fn module_unload(&self, module: ModuleHandle) -> VendorResult<()> {
        match self.modules.remove(&module) {
            Some(_) => Ok(()),
            None => Err(self.fail(VENDOR_ERR_INVALID_HANDLE)),
        }
    }

    fn module_get_function(&self, module: ModuleHandle, name: &str) -> VendorResult<FunctionHandle> {
        let entry = self.modules.get(&module).ok_or_else(|| self.fail(VENDOR_ERR_INVALID_HANDLE))?;
        if !entry.symbols.is_empty() && !entry.symbols.iter().any(|s| s == name) {
            return Err(self.fail(VENDOR_ERR_NOT_FOUND));
        }
        drop(entry);
        let func = self.next_function.fetch_add(1, Ordering::Relaxed);
        self.functions.insert(func, (module, name.to_string()));
        Ok(func)
    }

    fn module_get_global(&self, module: ModuleHandle, name: &str) -> VendorResult<(DevicePtr, u64)> {
        let entry = self.modules.get(&module).ok_or_else(|| self.fail(VENDOR_ERR_INVALID_HANDLE))?;
        if !entry.symbols.is_empty() && !entry.symbols.iter().any(|s| s == name) {
            return Err(self.fail(VENDOR_ERR_NOT_FOUND));
        }
        drop(entry);
        let key = (module, name.to_string());
        if let Some(ptr) = self.globals.get(&key) {
            return Ok((*ptr, 8));
        }
        let ptr = self.mem_alloc(8)?;
        self.globals.insert(key, ptr);
        Ok((ptr, 8))
    }

    fn launch_kernel(&self, func: FunctionHandle, cfg: &LaunchConfig, args: &[u8]) -> VendorResult<()> {
        if !self.functions.contains_key(&func) {
            return Err(self.fail(VENDOR_ERR_INVALID_HANDLE));
        }
        if cfg.grid.0 == 0 || cfg.block.0 == 0 {
            return Err(self.fail(VENDOR_ERR_INVALID_VALUE));
        }
        let _ = args;
        *self.launches.entry(func).or_insert(0) += 1;
        Ok(())
    }

    fn blas_create(&self) -> VendorResult<BlasHandle> {
        let handle = self.next_blas.fetch_add(1, Ordering::Relaxed);
        self.blas.insert(handle, ());
        Ok(handle)
    }

    fn blas_destroy(&self, handle: BlasHandle) -> VendorResult<()> {
        match self.blas.remove(&handle) {
            Some(_) => Ok(()),
            None => Err(self.fail(VENDOR_ERR_INVALID_HANDLE)),
        }
    }

    fn blas_set_stream(&self, handle: BlasHandle, stream: StreamHandle) -> VendorResult<()> {
        if !self.blas.contains_key(&handle) {
            return Err(self.fail(VENDOR_ERR_INVALID_HANDLE));
        }
        self.stream_synchronize(stream)
    }

    fn blas_set_math_mode(&self, handle: BlasHandle, _mode: u32) -> VendorResult<()> {
        if !self.blas.contains_key(&handle) {
            return Err(self.fail(VENDOR_ERR_INVALID_HANDLE));
        }
        Ok(())
    }

    fn blas_sgemm(&self, handle: BlasHandle, desc: &SgemmDesc) -> VendorResult<()> {
        if !self.blas.contains_key(&handle) {
            return Err(self.fail(VENDOR_ERR_INVALID_HANDLE));
        }
        if desc.m == 0 || desc.n == 0 || desc.k == 0 {
            return Err(self.fail(VENDOR_ERR_INVALID_VALUE));
        }
        Ok(())
    }

    fn last_error(&self) -> i32 {
        self.last_error.swap(0, Ordering::Relaxed)
    }

    fn error_string(&self, code: i32) -> String {
        match code {
            0 => "success".to_string(),
            VENDOR_ERR_INVALID_VALUE => "invalid value".to_string(),
            VENDOR_ERR_OUT_OF_MEMORY => "out of memory".to_string(),
            VENDOR_ERR_NOT_INITIALIZED => "not initialized".to_string(),
            VENDOR_ERR_INVALID_HANDLE => "invalid handle".to_string(),
            VENDOR_ERR_NOT_FOUND => "symbol not found".to_string(),
            other => format!("vendor error {other}"),
        }
    }
}
