use clap::Parser;
use waynefs::cli_interface::WayneFsCli;
use waynefs::error::FsError;

/// A CLI interface to create a filesystem image, or register it to `FUSE`
/// and mount it.
///
/// Mounting blocks the program until the filesystem is unmounted.
fn main() {
    env_logger::builder().format_timestamp_nanos().init();
    let args = WayneFsCli::parse();
    let result = match args {
        WayneFsCli::Mkfs(args) => waynefs::mkfs::mkfs(
            args.image_file_path,
            args.size_mb,
            args.block_size,
            args.inode_count,
            args.journal_blocks,
        ),
        WayneFsCli::Mount(args) => {
            waynefs::mount::mount(args.image_file_path, args.mount_point)
        }
    };
    if let Err(e) = result {
        eprintln!("waynefs: {e:#}");
        // distinct exit codes per structural mount failure
        let code = e
            .downcast_ref::<FsError>()
            .map(FsError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}
