use anyhow::Result;
use clap::Parser;
use obfusfs::ObfusFs;
use std::fs;

#[derive(Parser)]
struct Args {
    /// The path of the filesystem's mount
    #[clap(short, long, default_value = "/tmp/obfusfsmnt")]
    mount: String,

    /// The flat backing directory opaque-named files (and the metadata
    /// database) are stored in
    #[clap(short, long, default_value = "/tmp/obfusfsdata")]
    data: String,

    /// Password the metadata database is encrypted under
    #[clap(short, long)]
    password: String,

    /// Run filesystem in debug mode
    #[clap(short = 'v', long, default_value_t = false)]
    debug: bool,

    /// Run filesystem in foreground
    #[clap(short, long, default_value_t = false)]
    foreground: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let _ = fs::create_dir_all(&args.mount);
    let _ = fs::create_dir_all(&args.data);

    pretty_env_logger::init();

    ObfusFs::options()
        .debug(args.debug)
        .foreground(args.foreground)
        .build(&args.data, args.password.into_bytes())?
        .mount(args.mount)
}
