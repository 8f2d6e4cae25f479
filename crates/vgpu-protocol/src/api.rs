use serde::{Deserialize, Serialize};

/// Identifier of one intercepted accelerator API, carried in every inbound
/// frame. The value space is 16-bit, matching the transport header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApiId(pub u16);

// Runtime-facing calls.
pub const MALLOC: ApiId = ApiId(0x0100);
pub const FREE: ApiId = ApiId(0x0101);
pub const LAUNCH_KERNEL: ApiId = ApiId(0x0102);
pub const MEMCPY_H2D: ApiId = ApiId(0x0103);
pub const MEMCPY_D2H: ApiId = ApiId(0x0104);
pub const MEMCPY_D2D: ApiId = ApiId(0x0105);
pub const MEMCPY_H2D_ASYNC: ApiId = ApiId(0x0106);
pub const MEMCPY_D2H_ASYNC: ApiId = ApiId(0x0107);
pub const MEMCPY_D2D_ASYNC: ApiId = ApiId(0x0108);
pub const SET_DEVICE: ApiId = ApiId(0x0109);
pub const GET_LAST_ERROR: ApiId = ApiId(0x010a);
pub const GET_ERROR_STRING: ApiId = ApiId(0x010b);
pub const GET_DEVICE_COUNT: ApiId = ApiId(0x010c);
pub const GET_DEVICE: ApiId = ApiId(0x010d);
pub const STREAM_CREATE: ApiId = ApiId(0x010e);
pub const STREAM_SYNCHRONIZE: ApiId = ApiId(0x010f);
pub const EVENT_CREATE: ApiId = ApiId(0x0110);
pub const EVENT_DESTROY: ApiId = ApiId(0x0111);
pub const EVENT_RECORD: ApiId = ApiId(0x0112);

// Driver-level calls.
pub const MODULE_LOAD: ApiId = ApiId(0x0200);
pub const MODULE_GET_FUNCTION: ApiId = ApiId(0x0201);
pub const REGISTER_VAR: ApiId = ApiId(0x0202);
pub const PRIMARY_CTX_GET_STATE: ApiId = ApiId(0x0203);

// Linear-algebra calls.
pub const BLAS_CREATE: ApiId = ApiId(0x0300);
pub const BLAS_SET_STREAM: ApiId = ApiId(0x0301);
pub const BLAS_SET_MATH_MODE: ApiId = ApiId(0x0302);
pub const BLAS_SGEMM: ApiId = ApiId(0x0303);

// Runtime-internal calls.
pub const CHECKPOINT: ApiId = ApiId(0x0400);

/// Static per-API metadata consulted by the dispatch boundary.
#[derive(Debug, Clone, Copy)]
pub struct ApiMeta {
    pub name: &'static str,
    /// Whether the guest blocks on the reply. Asynchronous calls return a
    /// success retcode as soon as the call is queued.
    pub is_sync: bool,
}

impl ApiId {
    pub fn meta(self) -> Option<&'static ApiMeta> {
        macro_rules! meta {
            ($name:literal, $sync:expr) => {
                &ApiMeta { name: $name, is_sync: $sync }
            };
        }
        Some(match self {
            MALLOC => meta!("Malloc", true),
            FREE => meta!("Free", true),
            LAUNCH_KERNEL => meta!("LaunchKernel", false),
            MEMCPY_H2D => meta!("MemcpyHtoD", true),
            MEMCPY_D2H => meta!("MemcpyDtoH", true),
            MEMCPY_D2D => meta!("MemcpyDtoD", true),
            MEMCPY_H2D_ASYNC => meta!("MemcpyHtoDAsync", false),
            MEMCPY_D2H_ASYNC => meta!("MemcpyDtoHAsync", true),
            MEMCPY_D2D_ASYNC => meta!("MemcpyDtoDAsync", false),
            SET_DEVICE => meta!("SetDevice", true),
            GET_LAST_ERROR => meta!("GetLastError", true),
            GET_ERROR_STRING => meta!("GetErrorString", true),
            GET_DEVICE_COUNT => meta!("GetDeviceCount", true),
            GET_DEVICE => meta!("GetDevice", true),
            STREAM_CREATE => meta!("StreamCreate", true),
            STREAM_SYNCHRONIZE => meta!("StreamSynchronize", true),
            EVENT_CREATE => meta!("EventCreate", true),
            EVENT_DESTROY => meta!("EventDestroy", true),
            EVENT_RECORD => meta!("EventRecord", false),
            MODULE_LOAD => meta!("ModuleLoad", true),
            MODULE_GET_FUNCTION => meta!("ModuleGetFunction", true),
            REGISTER_VAR => meta!("RegisterVar", true),
            PRIMARY_CTX_GET_STATE => meta!("PrimaryCtxGetState", true),
            BLAS_CREATE => meta!("BlasCreate", true),
            BLAS_SET_STREAM => meta!("BlasSetStream", true),
            BLAS_SET_MATH_MODE => meta!("BlasSetMathMode", true),
            BLAS_SGEMM => meta!("BlasSgemm", false),
            CHECKPOINT => meta!("Checkpoint", true),
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        self.meta().map(|m| m.name).unwrap_or("Unknown")
    }
}

impl std::fmt::Display for ApiId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(0x{:04x})", self.name(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_covers_all_named_apis() {
        for id in [
            MALLOC, FREE, LAUNCH_KERNEL, MEMCPY_H2D, MEMCPY_D2H, MEMCPY_D2D,
            MEMCPY_H2D_ASYNC, MEMCPY_D2H_ASYNC, MEMCPY_D2D_ASYNC, SET_DEVICE,
            GET_LAST_ERROR, GET_ERROR_STRING, GET_DEVICE_COUNT, GET_DEVICE,
            STREAM_CREATE, STREAM_SYNCHRONIZE, EVENT_CREATE, EVENT_DESTROY,
            EVENT_RECORD, MODULE_LOAD, MODULE_GET_FUNCTION, REGISTER_VAR,
            PRIMARY_CTX_GET_STATE, BLAS_CREATE, BLAS_SET_STREAM,
            BLAS_SET_MATH_MODE, BLAS_SGEMM, CHECKPOINT,
        ] {
            assert!(id.meta().is_some(), "missing meta for {id:?}");
        }
        assert!(ApiId(0xffff).meta().is_none());
    }
}
