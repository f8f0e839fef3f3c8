//! Archive file (tarball) boundaries and volume fitting for one copy
//! instance.

use crate::archreq::{ArchReq, CpiSlot};
use tracing::debug;

/// Mark archive file boundaries for the files of copy instance `cpi` on
/// a volume with `vol_space` bytes free.
///
/// A new archive file starts whenever the running archive file would
/// reach `archmax`, so a file that lands the archive file exactly on
/// `archmax` already opens the next one and no archive file ever holds
/// `archmax` bytes or more unless a single file is that large. A file of at least `ovflmin` bytes that does not fit
/// the remaining volume space is placed alone in the last archive file
/// and may overflow onto a continuation volume. Files that cannot be
/// placed are left for a later pass. Returns the space used.
pub fn make_tarballs(
    ar: &mut ArchReq,
    cpi: usize,
    archmax: u64,
    ovflmin: Option<u64>,
    vol_space: u64,
) -> u64 {
    let slot = CpiSlot::Assigned(cpi as u16);
    let ovflmin = ovflmin.unwrap_or(u64::MAX);
    let mut space: u64 = 0;
    let mut tarball: u64 = 0;
    let mut started = false;
    let mut stop = None;

    for i in 0..ar.sel_files {
        let fi = &mut ar.files[i];
        if fi.cpi != slot || fi.is_finished() {
            continue;
        }
        fi.first = false;
        if space.saturating_add(fi.space) > vol_space {
            if fi.space >= ovflmin {
                fi.first = true;
                space = vol_space;
                stop = Some(i + 1);
                break;
            } else if fi.space > vol_space {
                fi.cpi = CpiSlot::Later;
                continue;
            }
            stop = Some(i);
            break;
        }
        if !started || tarball.saturating_add(fi.space) >= archmax {
            fi.first = true;
            tarball = 0;
        }
        started = true;
        space += fi.space;
        tarball += fi.space;
    }

    if let Some(from) = stop {
        for fi in ar.files[from..ar.sel_files].iter_mut() {
            if fi.cpi == slot {
                fi.cpi = CpiSlot::Later;
            }
        }
    }
    ar.cpi[cpi].space = space;
    debug!("{} cpi {}: {} bytes in archive files", ar.name(), cpi, space);
    space
}

/// Keep the files of copy instance `cpi` that fit `avail` bytes and are
/// at least `min_size` long; the rest wait for another pass.
pub fn select_fit(ar: &mut ArchReq, cpi: usize, avail: u64, min_size: u64) {
    let slot = CpiSlot::Assigned(cpi as u16);
    let mut files = 0;
    let mut space: u64 = 0;
    let mut more = 0;
    for fi in ar.files[..ar.sel_files].iter_mut() {
        if fi.cpi != slot {
            continue;
        }
        if fi.file_size >= min_size && space.saturating_add(fi.space) <= avail {
            files += 1;
            space += fi.space;
        } else {
            fi.cpi = CpiSlot::More;
            more += 1;
        }
    }
    let drives_used = ar.drives_used;
    let ci = &mut ar.cpi[cpi];
    ci.files = files;
    ci.space = space;
    if more != 0 && drives_used > 1 {
        ci.more = true;
    }
}
