//! Register the filesystem with FUSE and mount it. Blocks until the
//! filesystem is unmounted.

use std::path::Path;

use crate::fs::{FuseDriver, WayneFS};

pub fn mount<P>(image_path: P, mountpoint: P) -> anyhow::Result<()>
where
    P: AsRef<Path>,
{
    // journal recovery runs inside; a dirty image is consistent before the
    // kernel sees it
    let fs = WayneFS::mount(image_path)?;
    let driver = FuseDriver::new(fs);
    Ok(fuser::mount2(driver, mountpoint, &FuseDriver::mount_options())?)
}
