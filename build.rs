//! Stamps the build date; generated control scripts record it in their header.

fn main() {
    println!("cargo:rerun-if-changed=src/script/retarget.py.j2");
    println!("cargo:rerun-if-env-changed=BLEND_RETARGET_BUILD_DATE");

    let stamp = std::env::var("BLEND_RETARGET_BUILD_DATE").unwrap_or_else(|_| {
        let format = time::macros::format_description!("[year]-[month]-[day]");
        time::OffsetDateTime::now_utc()
            .format(&format)
            .unwrap_or_else(|_| "unknown".to_string())
    });
    println!("cargo:rustc-env=BLEND_RETARGET_BUILD_DATE={stamp}");
}
