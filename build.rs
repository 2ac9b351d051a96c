fn main() {
    // Stamp the build so `ipcbus::BUILD_DATE` identifies the binary a child runs
    let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    println!("cargo:rustc-env=BUILD_DATE={}", stamp);
    println!("cargo:rerun-if-changed=build.rs");
}
