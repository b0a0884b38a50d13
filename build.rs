use std::env;
use std::path::Path;

fn main() {
    println!("cargo:rerun-if-env-changed=FFMPEG_DIR");
    println!("cargo:rerun-if-env-changed=VCPKG_ROOT");

    // Native FFmpeg is only linked by the `ffmpeg` backend, and only Windows
    // needs help finding it.
    if env::var_os("CARGO_FEATURE_FFMPEG").is_none()
        || env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("windows")
        || env::var_os("FFMPEG_DIR").is_some()
    {
        return;
    }

    match env::var("VCPKG_ROOT") {
        Ok(root) => {
            let installed = Path::new(&root).join("installed").join("x64-windows");
            println!(
                "cargo:warning=snapcache: FFMPEG_DIR unset; point it at {} if ffmpeg-sys-next cannot find FFmpeg",
                installed.display()
            );
        }
        Err(_) => println!(
            "cargo:warning=snapcache: the `ffmpeg` feature needs FFmpeg development files; set FFMPEG_DIR"
        ),
    }
}
