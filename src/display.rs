use crate::config::{ArchiveSet, ConfigSnapshot, LibraryConfig};
use crate::copy::CopyJob;
use crate::device::ArchLibTable;
use crate::error::ConfigIssue;
use crate::queue::QueueSummary;
use crate::schedule::SchedulerStatus;
use crate::utils::{format_bytes, truncate_string};
use crate::volume::SetVolumes;

/// Display configuration problems found while loading
pub fn display_config_issues(issues: &[ConfigIssue]) {
    println!("Configuration has {} error(s):", issues.len());
    for issue in issues {
        println!("  {}", issue);
    }
}

fn size_or_default(size: Option<u64>) -> String {
    size.map(format_bytes).unwrap_or_else(|| "-".to_string())
}

fn set_row(config: &ConfigSnapshot, set: &ArchiveSet) {
    println!(
        "{:<20} {:<5} {:>6} {:>12} {:>12} {:<8} {:<10} {:>5}",
        truncate_string(&set.name, 20),
        set.mtype.as_deref().unwrap_or("-"),
        set.drives,
        format_bytes(config.archmax(set)),
        size_or_default(set.drivemax),
        format!("{:?}", set.join).to_lowercase(),
        format!("{:?}", set.sort).to_lowercase(),
        set.vsns.len()
    );
}

/// Display the resolved archive set table
pub fn display_sets(config: &ConfigSnapshot) {
    println!(
        "{:<20} {:<5} {:>6} {:>12} {:>12} {:<8} {:<10} {:>5}",
        "Archive set", "Media", "Drives", "Archmax", "Drivemax", "Join", "Sort", "VSNs"
    );
    println!("{:-<86}", "");
    for set in config.copy_sets() {
        set_row(config, set);
    }
}

/// Display configured libraries and their drives
pub fn display_libraries(libraries: &[LibraryConfig]) {
    if libraries.is_empty() {
        println!("No libraries configured");
        return;
    }
    println!("{:<16} {:>5} {:<10} {:>7} {:>9}", "Library", "Eq", "Kind", "Drives", "Allowed");
    println!("{:-<51}", "");
    for lib in libraries {
        println!(
            "{:<16} {:>5} {:<10} {:>7} {:>9}",
            truncate_string(&lib.name, 16),
            lib.eq,
            format!("{:?}", lib.kind).to_lowercase(),
            lib.drives.len(),
            lib.drives_allow.map(|n| n.to_string()).unwrap_or_else(|| "all".to_string())
        );
        for drive in &lib.drives {
            let loaded = drive
                .loaded
                .as_ref()
                .map(|(m, v)| format!("{}.{}", m, v))
                .unwrap_or_default();
            println!(
                "  {:<14} {:>5} {:<10} {}",
                drive.name,
                drive.eq,
                if drive.available { "on" } else { "off" },
                loaded
            );
        }
    }
}

/// Display the copies a scheduling pass would start
pub fn display_plan(jobs: &[CopyJob], queues: &[QueueSummary]) {
    if jobs.is_empty() {
        println!("No copies can start");
    }
    for job in jobs {
        let drive = job
            .drive
            .map(|d| format!("drive {} in library {}", d.drive_eq, d.lib_eq))
            .unwrap_or_else(|| "disk".to_string());
        let space: u64 = job.files.iter().map(|f| f.space).sum();
        println!(
            "{} -> {}.{} ({}), {} files, {}",
            job.id(),
            job.volume.mtype,
            job.volume.vsn,
            drive,
            job.files.len(),
            format_bytes(space)
        );
        let mut tarball = 0;
        for file in &job.files {
            if file.first {
                tarball += 1;
                println!("  archive file {}", tarball);
            }
            println!("    {:<50} {:>12}", truncate_string(&file.path, 50), format_bytes(file.space));
        }
    }

    let waiting: Vec<_> = queues.iter().filter(|q| q.stall_reason.is_some()).collect();
    if !waiting.is_empty() {
        println!();
        println!("Not scheduled:");
        for q in waiting {
            println!(
                "  {:<30} {:<8} {}",
                q.name,
                q.queue.to_string(),
                q.stall_reason.as_deref().unwrap_or_default()
            );
        }
    }
}

/// Display the volumes each archive set may use
pub fn display_volumes(listing: &[SetVolumes]) {
    for set in listing {
        println!("Archive set {}:", set.set);
        if set.volumes.is_empty() {
            println!("  no volumes available");
            continue;
        }
        println!(
            "  {:<5} {:<10} {:<12} {:>6} {:>12} {:>12} {:<6} {}",
            "Media", "VSN", "Library", "Slot", "Capacity", "Space", "Loaded", "Reserved"
        );
        for v in &set.volumes {
            println!(
                "  {:<5} {:<10} {:<12} {:>6} {:>12} {:>12} {:<6} {}",
                v.mtype,
                v.vsn,
                truncate_string(&v.library, 12),
                v.slot.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                format_bytes(v.capacity),
                format_bytes(v.space),
                if v.loaded { "yes" } else { "" },
                v.reserved.as_deref().unwrap_or_default()
            );
        }
    }
}

/// Display queue contents and drive usage
pub fn display_status(status: &SchedulerStatus) {
    println!("Archiving: rm {}, dk {}", status.rm, status.dk);
    for (fs, state) in &status.fs {
        println!("  fs {}: {}", fs, state);
    }
    for lib in &status.libraries {
        println!(
            "  {:<16} drives allowed {}, available {}, busy {}",
            lib.name, lib.drives_allow, lib.drives_avail, lib.drives_busy
        );
    }
    if status.queues.is_empty() {
        println!("All queues empty");
        return;
    }
    println!(
        "{:<9} {:<30} {:>7} {:>12} {:>7} {}",
        "Queue", "Request", "Files", "Space", "Copies", "Reason"
    );
    println!("{:-<80}", "");
    for q in &status.queues {
        println!(
            "{:<9} {:<30} {:>7} {:>12} {:>7} {}",
            q.queue.to_string(),
            truncate_string(&q.name, 30),
            q.files,
            format_bytes(q.space),
            q.active_copies,
            q.stall_reason.as_deref().unwrap_or_default()
        );
    }
}

/// Display the drives each library has
pub fn display_drive_table(libs: &ArchLibTable) {
    for lib in &libs.libs {
        let busy = lib.drives.iter().filter(|d| d.busy).count();
        println!(
            "{:<16} {:<10} {} of {} drives available, {} busy",
            truncate_string(&lib.name, 16),
            if lib.available { "on" } else { "off" },
            lib.drives_avail,
            lib.drives.len(),
            busy
        );
    }
}
