//! Locating `.eh_frame_hdr` for a pc among the loaded modules

#![allow(unsafe_code)]

/// Where a module's unwind tables live in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EhFrameLocation {
    /// Runtime address of `.eh_frame_hdr`
    pub hdr: usize,
    pub hdr_len: usize,
    /// End of the loaded segment holding `.eh_frame_hdr`; `.eh_frame`
    /// follows it in the same segment
    pub segment_end: usize,
}

#[cfg(target_os = "linux")]
pub(crate) fn find_eh_frame(pc: usize) -> Option<EhFrameLocation> {
    use std::ffi::{c_int, c_void};

    struct Search {
        pc: usize,
        found: Option<EhFrameLocation>,
    }

    unsafe extern "C" fn visit(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let search = &mut *data.cast::<Search>();
        let info = &*info;
        if info.dlpi_phdr.is_null() {
            return 0;
        }
        let pc = search.pc;
        let bias = info.dlpi_addr as usize;
        let phdrs = std::slice::from_raw_parts(info.dlpi_phdr, usize::from(info.dlpi_phnum));

        let segments = phdrs.iter().filter(|p| p.p_type == libc::PT_LOAD).map(|p| {
            let start = bias.wrapping_add(p.p_vaddr as usize);
            (start, start.wrapping_add(p.p_memsz as usize))
        });
        if !segments.clone().any(|(start, end)| (start..end).contains(&pc)) {
            return 0;
        }

        // The module owning pc is found; stop iterating whatever the outcome
        search.found = phdrs.iter().find(|p| p.p_type == libc::PT_GNU_EH_FRAME).map(|hdr| {
            let hdr_addr = bias.wrapping_add(hdr.p_vaddr as usize);
            let hdr_len = hdr.p_memsz as usize;
            let segment_end = segments
                .clone()
                .find(|(start, end)| (*start..*end).contains(&hdr_addr))
                .map_or(hdr_addr + hdr_len, |(_, end)| end);
            EhFrameLocation { hdr: hdr_addr, hdr_len, segment_end }
        });
        1
    }

    let mut search = Search { pc, found: None };
    unsafe {
        libc::dl_iterate_phdr(Some(visit), std::ptr::addr_of_mut!(search).cast());
    }
    search.found
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn find_eh_frame(_pc: usize) -> Option<EhFrameLocation> {
    None
}
