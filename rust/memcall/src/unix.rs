use crate::error::MemcallError;
use crate::types::RlimitResource;
use once_cell::sync::Lazy;
use std::ptr;

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize });

#[inline]
fn as_mut_ptr(region: &mut [u8]) -> *mut libc::c_void {
    region.as_mut_ptr().cast()
}

pub(crate) fn alloc(size: usize) -> Result<&'static mut [u8], MemcallError> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(MemcallError::last_os_error("<memcall> could not allocate"));
    }

    // SAFETY: mmap returned a fresh private mapping of exactly `size` bytes that
    // nothing else references; it stays valid until `free` unmaps it.
    let region = unsafe { std::slice::from_raw_parts_mut(ptr.cast::<u8>(), size) };
    region.fill(0);

    Ok(region)
}

pub(crate) fn free(region: &mut [u8]) -> Result<(), MemcallError> {
    if region.is_empty() {
        return Ok(());
    }

    wipe_volatile(region);

    let result = unsafe { libc::munmap(as_mut_ptr(region), region.len()) };
    if result != 0 {
        return Err(MemcallError::last_os_error(&format!(
            "<memcall> could not deallocate {:p}",
            region.as_ptr()
        )));
    }

    Ok(())
}

pub(crate) fn lock(region: &mut [u8]) -> Result<(), MemcallError> {
    if region.is_empty() {
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    unsafe {
        // Advisory only; a failure here does not make the region swappable.
        if libc::madvise(as_mut_ptr(region), region.len(), libc::MADV_DONTDUMP) != 0 {
            log::debug!(
                "<memcall> madvise(MADV_DONTDUMP) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    let result = unsafe { libc::mlock(as_mut_ptr(region), region.len()) };
    if result != 0 {
        return Err(MemcallError::last_os_error(&format!(
            "<memcall> could not acquire lock on {:p}, limit reached?",
            region.as_ptr()
        )));
    }

    Ok(())
}

pub(crate) fn unlock(region: &mut [u8]) -> Result<(), MemcallError> {
    if region.is_empty() {
        return Ok(());
    }

    let result = unsafe { libc::munlock(as_mut_ptr(region), region.len()) };
    if result != 0 {
        return Err(MemcallError::last_os_error(&format!(
            "<memcall> could not free lock on {:p}",
            region.as_ptr()
        )));
    }

    Ok(())
}

pub(crate) fn page_size() -> usize {
    *PAGE_SIZE
}

pub(crate) fn set_limit(resource: RlimitResource, value: u64) -> Result<(), MemcallError> {
    let resource_id = match resource {
        RlimitResource::Core => libc::RLIMIT_CORE,
        RlimitResource::MemLock => libc::RLIMIT_MEMLOCK,
    };

    let rlimit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };

    let result = unsafe { libc::setrlimit(resource_id, &rlimit) };
    if result != 0 {
        return Err(MemcallError::last_os_error("<memcall> could not set rlimit"));
    }

    Ok(())
}

pub(crate) fn get_limit(resource: RlimitResource) -> Result<Option<u64>, MemcallError> {
    let resource_id = match resource {
        RlimitResource::Core => libc::RLIMIT_CORE,
        RlimitResource::MemLock => libc::RLIMIT_MEMLOCK,
    };

    let mut rlimit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    let result = unsafe { libc::getrlimit(resource_id, &mut rlimit) };
    if result != 0 {
        return Err(MemcallError::last_os_error("<memcall> could not get rlimit"));
    }

    if rlimit.rlim_cur == libc::RLIM_INFINITY {
        Ok(None)
    } else {
        Ok(Some(rlimit.rlim_cur as u64))
    }
}

// Volatile writes keep the wipe from being elided right before munmap.
fn wipe_volatile(region: &mut [u8]) {
    for byte in region.iter_mut() {
        unsafe { ptr::write_volatile(byte, 0) };
    }
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
}
