use crate::error::MemcallError;
use crate::types::RlimitResource;

fn not_supported(call: &str) -> MemcallError {
    MemcallError::NotSupported(format!("<memcall> {call} is only implemented on unix targets"))
}

pub(crate) fn alloc(_size: usize) -> Result<&'static mut [u8], MemcallError> {
    Err(not_supported("alloc"))
}

pub(crate) fn free(_region: &mut [u8]) -> Result<(), MemcallError> {
    Err(not_supported("free"))
}

pub(crate) fn lock(_region: &mut [u8]) -> Result<(), MemcallError> {
    Err(not_supported("lock"))
}

pub(crate) fn unlock(_region: &mut [u8]) -> Result<(), MemcallError> {
    Err(not_supported("unlock"))
}

pub(crate) fn page_size() -> usize {
    4096
}

pub(crate) fn set_limit(_resource: RlimitResource, _value: u64) -> Result<(), MemcallError> {
    Err(not_supported("set_limit"))
}

pub(crate) fn get_limit(_resource: RlimitResource) -> Result<Option<u64>, MemcallError> {
    Err(not_supported("get_limit"))
}
