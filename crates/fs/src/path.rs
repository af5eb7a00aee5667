//! Path resolution (spec.md §4.6): walks a `/`-separated path from either
//! the root or a caller-supplied working directory down to a final
//! directory or file.

use alloc::string::{String, ToString};

use block_device::BlockDevice;
use sync::Scheduler;

use crate::FileSystem;
use crate::directory;
use crate::error::FsError;
use crate::free_map::ROOT_DIR_SECTOR;
use crate::inode;

/// What a path resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Dir { sector: u32 },
    File { parent_sector: u32, name: String },
}

/// Resolves `path` starting at `cwd_sector` (used when `path` is relative)
/// or at the root (when `path` starts with `/`).
///
/// An intermediate component that doesn't exist, or that names a file
/// instead of a directory, fails resolution outright. A missing *final*
/// component is not an error — it's returned as a `File` target for
/// callers like `create` that need a parent directory and a fresh name.
pub(crate) fn resolve<S: Scheduler, D: BlockDevice>(
    fs: &FileSystem<S, D>,
    cwd_sector: u32,
    path: &str,
) -> Result<Resolved, FsError> {
    let mut current = if path.starts_with('/') {
        ROOT_DIR_SECTOR
    } else {
        cwd_sector
    };

    let trimmed = path.trim_end_matches('/');
    let components: alloc::vec::Vec<&str> =
        trimmed.split('/').filter(|c| !c.is_empty()).collect();

    if components.is_empty() {
        return Ok(Resolved::Dir { sector: current });
    }

    for (i, component) in components.iter().enumerate() {
        let is_last = i + 1 == components.len();

        if *component == "." {
            if is_last {
                return Ok(Resolved::Dir { sector: current });
            }
            continue;
        }

        if *component == ".." {
            let disk = inode::read_disk_inode(&fs.cache, current)?;
            current = disk.parent_sector;
            if is_last {
                return Ok(Resolved::Dir { sector: current });
            }
            continue;
        }

        let found = directory::lookup(fs, current, component)?;
        if is_last {
            return match found {
                Some(sector) => {
                    let disk = inode::read_disk_inode(&fs.cache, sector)?;
                    if disk.is_dir {
                        Ok(Resolved::Dir { sector })
                    } else {
                        Ok(Resolved::File {
                            parent_sector: current,
                            name: component.to_string(),
                        })
                    }
                }
                None => Ok(Resolved::File {
                    parent_sector: current,
                    name: component.to_string(),
                }),
            };
        }

        match found {
            Some(sector) => {
                let disk = inode::read_disk_inode(&fs.cache, sector)?;
                if !disk.is_dir {
                    return Err(FsError::NotADirectory);
                }
                current = sector;
            }
            None => return Err(FsError::NotFound),
        }
    }

    unreachable!("the loop above always returns on its last component")
}
