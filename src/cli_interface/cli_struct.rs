use clap::Parser;

#[derive(Parser, Debug, PartialEq)]
#[command(author, version, about, long_about)]
pub enum WayneFsCli {
    /// create a new filesystem image
    Mkfs(MkfsArgs),
    /// mount an existing image through FUSE
    Mount(MountArgs),
}

/// make a new fs subcommand
#[derive(clap::Args, Debug, PartialEq)]
#[command(author, version, about = "make a new filesystem image")]
pub struct MkfsArgs {
    /// the path of the filesystem image file
    #[clap(short = 'p', long)]
    pub image_file_path: String,
    /// total image size in MiB
    #[clap(short, long)]
    pub size_mb: u64,
    /// the block size of the filesystem
    #[clap(short, long, default_value_t = 4096)]
    pub block_size: u32,
    /// the inode count of the filesystem
    #[clap(short, long)]
    pub inode_count: u32,
    /// journal region size in blocks (derived from the image size if unset)
    #[clap(short, long)]
    pub journal_blocks: Option<u32>,
}

/// mount a fs subcommand
#[derive(clap::Args, Debug, PartialEq)]
#[command(author, version, about = "mount a filesystem image")]
pub struct MountArgs {
    /// the path of the filesystem image file
    #[clap(short = 'p', long)]
    pub image_file_path: String,
    /// the mount point of the filesystem
    #[clap(short, long)]
    pub mount_point: String,
}

/// test the `WayneFsCli` struct
/// test `mkfs` subcommand
#[cfg(test)]
mod mkfs_parse_args_tests {
    use super::*;
    /// test short parameter form
    #[test]
    fn test_short_parameter_form() {
        let args = WayneFsCli::parse_from([
            "waynefs", "mkfs", "-p", "test.img", "-s", "128", "-i", "1024", "-b", "4096",
        ]);
        assert_eq!(
            args,
            WayneFsCli::Mkfs(MkfsArgs {
                image_file_path: "test.img".to_string(),
                size_mb: 128,
                block_size: 4096,
                inode_count: 1024,
                journal_blocks: None,
            })
        );
    }
    /// test long parameter form
    #[test]
    fn test_long_parameter_form() {
        let args = WayneFsCli::parse_from([
            "waynefs",
            "mkfs",
            "--image-file-path",
            "test.img",
            "--size-mb",
            "128",
            "--inode-count",
            "1024",
            "--block-size",
            "4096",
            "--journal-blocks",
            "256",
        ]);
        assert_eq!(
            args,
            WayneFsCli::Mkfs(MkfsArgs {
                image_file_path: "test.img".to_string(),
                size_mb: 128,
                block_size: 4096,
                inode_count: 1024,
                journal_blocks: Some(256),
            })
        );
    }

    #[test]
    fn test_block_size_defaults() {
        let args =
            WayneFsCli::parse_from(["waynefs", "mkfs", "-p", "test.img", "-s", "128", "-i", "64"]);
        let WayneFsCli::Mkfs(args) = args else {
            panic!("expected mkfs subcommand");
        };
        assert_eq!(args.block_size, 4096);
    }
}

/// test the `WayneFsCli` struct
/// test `mount` subcommand
#[cfg(test)]
mod mount_parse_args_tests {
    use super::*;
    /// test short parameter form
    #[test]
    fn test_short_parameter_form() {
        let args = WayneFsCli::parse_from(["waynefs", "mount", "-p", "test.img", "-m", "/mnt"]);
        assert_eq!(
            args,
            WayneFsCli::Mount(MountArgs {
                image_file_path: "test.img".to_string(),
                mount_point: "/mnt".to_string(),
            })
        );
    }
    /// test long parameter form
    #[test]
    fn test_long_parameter_form() {
        let args = WayneFsCli::parse_from([
            "waynefs",
            "mount",
            "--image-file-path",
            "test.img",
            "--mount-point",
            "/mnt",
        ]);
        assert_eq!(
            args,
            WayneFsCli::Mount(MountArgs {
                image_file_path: "test.img".to_string(),
                mount_point: "/mnt".to_string(),
            })
        );
    }
}
