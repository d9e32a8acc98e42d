//! User-memory validation and copying.
//!
//! The kernel never dereferences a user pointer directly. Ranges are
//! validated against the user address ceiling first, then each page is
//! checked against the task's address space, and the bytes move through
//! the high-half direct map, so a hostile or concurrently-unmapped
//! pointer can produce an error return but never a kernel fault.

use super::address_space::AddressSpace;
use crate::config::{FRAME_SIZE, USER_ADDR_MAX};
use crate::error::{Errno, SysResult};

/// Pure range check: no nulls with length, no kernel-half addresses,
/// no wrap-around.
pub fn validate_user_range(va: u64, len: usize) -> SysResult<()> {
    if len == 0 {
        return Ok(());
    }
    if va == 0 {
        return Err(Errno::Fault);
    }
    let end = va.checked_add(len as u64).ok_or(Errno::Fault)?;
    if va > USER_ADDR_MAX || end - 1 > USER_ADDR_MAX {
        return Err(Errno::Fault);
    }
    Ok(())
}

/// Range check plus per-page mapping check against `space`.
pub fn validate_user_buffer(
    space: &AddressSpace,
    va: u64,
    len: usize,
    write: bool,
) -> SysResult<()> {
    validate_user_range(va, len)?;
    if !space.is_user_range_accessible(va, len, write) {
        return Err(Errno::Fault);
    }
    Ok(())
}

/// Copy `dst.len()` bytes from user `va` into `dst`.
pub fn copy_from_user(space: &AddressSpace, dst: &mut [u8], va: u64) -> SysResult<()> {
    validate_user_buffer(space, va, dst.len(), false)?;
    let hhdm = space.hhdm_base();
    let mut copied = 0usize;
    while copied < dst.len() {
        let cur = va + copied as u64;
        let page_off = (cur % FRAME_SIZE as u64) as usize;
        let chunk = (FRAME_SIZE - page_off).min(dst.len() - copied);
        let mapping = space.translate(cur).ok_or(Errno::Fault)?;
        let src = hhdm + mapping.phys.as_u64() + page_off as u64;
        // SAFETY: the page was verified mapped and user-accessible; the
        // chunk stays within one frame reached through the direct map.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src as *const u8,
                dst[copied..].as_mut_ptr(),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy `src` to user `va`.
pub fn copy_to_user(space: &AddressSpace, va: u64, src: &[u8]) -> SysResult<()> {
    validate_user_buffer(space, va, src.len(), true)?;
    let hhdm = space.hhdm_base();
    let mut copied = 0usize;
    while copied < src.len() {
        let cur = va + copied as u64;
        let page_off = (cur % FRAME_SIZE as u64) as usize;
        let chunk = (FRAME_SIZE - page_off).min(src.len() - copied);
        let mapping = space.translate(cur).ok_or(Errno::Fault)?;
        let dst = hhdm + mapping.phys.as_u64() + page_off as u64;
        // SAFETY: page verified mapped, user and writable; chunk bounded
        // to the frame.
        unsafe {
            core::ptr::copy_nonoverlapping(src[copied..].as_ptr(), dst as *mut u8, chunk);
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy one plain-data value out to user memory.
pub fn copy_to_user_value<T: Copy>(space: &AddressSpace, va: u64, value: &T) -> SysResult<()> {
    // SAFETY: T is Copy plain data; viewing it as bytes is sound.
    let bytes = unsafe {
        core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
    };
    copy_to_user(space, va, bytes)
}

/// Copy one plain-data value in from user memory.
pub fn copy_from_user_value<T: Copy + Default>(space: &AddressSpace, va: u64) -> SysResult<T> {
    let mut value = T::default();
    {
        // SAFETY: writing the value's own bytes through a byte view.
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(
                &mut value as *mut T as *mut u8,
                core::mem::size_of::<T>(),
            )
        };
        copy_from_user(space, bytes, va)?;
    }
    Ok(value)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::config::KERNEL_HALF_BASE;
    use crate::mm::page_table::tests::mock_mapper;
    use crate::mm::{MapFlags, VirtualAddress};

    #[test]
    fn range_validation_boundaries() {
        assert!(validate_user_range(0, 0).is_ok());
        assert_eq!(validate_user_range(0, 1), Err(Errno::Fault));
        assert!(validate_user_range(0x1000, 16).is_ok());
        assert_eq!(validate_user_range(USER_ADDR_MAX + 1, 1), Err(Errno::Fault));
        // Straddling the ceiling.
        assert_eq!(
            validate_user_range(USER_ADDR_MAX - 7, 16),
            Err(Errno::Fault)
        );
        // Wrap-around.
        assert_eq!(validate_user_range(u64::MAX - 4, 16), Err(Errno::Fault));
        assert_eq!(validate_user_range(KERNEL_HALF_BASE, 16), Err(Errno::Fault));
    }

    #[test]
    fn copies_cross_page_boundaries() {
        let (m, _mem) = mock_mapper();
        let space = crate::mm::address_space::AddressSpace::new(m).unwrap();
        let va = VirtualAddress::new(0x4000_0000);
        space.map_anonymous(va, 2, MapFlags::WRITABLE).unwrap();

        let src: alloc::vec::Vec<u8> = (0u8..100).collect();
        // Write across the page boundary.
        let target = va.as_u64() + FRAME_SIZE as u64 - 50;
        copy_to_user(&space, target, &src).unwrap();
        let mut back = [0u8; 100];
        copy_from_user(&space, &mut back, target).unwrap();
        assert_eq!(&back[..], &src[..]);
    }

    #[test]
    fn copy_to_readonly_page_faults() {
        let (m, _mem) = mock_mapper();
        let space = crate::mm::address_space::AddressSpace::new(m).unwrap();
        let va = VirtualAddress::new(0x4000_0000);
        space.map_anonymous(va, 1, MapFlags::empty()).unwrap();
        assert_eq!(
            copy_to_user(&space, va.as_u64(), &[1, 2, 3]),
            Err(Errno::Fault)
        );
        // Reading is still fine.
        let mut buf = [0u8; 3];
        copy_from_user(&space, &mut buf, va.as_u64()).unwrap();
    }

    #[test]
    fn unmapped_page_faults() {
        let (m, _mem) = mock_mapper();
        let space = crate::mm::address_space::AddressSpace::new(m).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            copy_from_user(&space, &mut buf, 0x5000_0000),
            Err(Errno::Fault)
        );
    }

    #[test]
    fn value_roundtrip() {
        let (m, _mem) = mock_mapper();
        let space = crate::mm::address_space::AddressSpace::new(m).unwrap();
        let va = VirtualAddress::new(0x4000_0000);
        space.map_anonymous(va, 1, MapFlags::WRITABLE).unwrap();
        copy_to_user_value(&space, va.as_u64() + 8, &0xdead_beef_u64).unwrap();
        let got: u64 = copy_from_user_value(&space, va.as_u64() + 8).unwrap();
        assert_eq!(got, 0xdead_beef);
    }
}
