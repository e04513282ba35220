use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{exit, Command, ExitStatus};

use clap::{Parser, Subcommand, ValueEnum};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const FUNCTION_CRATE: &str = "blob_transfer_function";
const HANDLER_BIN: &str = "process_blob_upload";
const FUNCTION_NAME: &str = "processBlobUpload";

// ── CLI definition ─────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "xtask",
    about = "Task runner for the blob transfer function workspace",
    long_about = "A unified CLI for packaging the blob transfer custom handler,\n\
                  running it locally, and running CI checks."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the custom handler locally against the configured storage account
    Serve,
    /// Run CI checks (fmt, clippy, tests)
    Ci {
        /// Job to run
        #[arg(value_enum, default_value_t = CiJob::Check)]
        job: CiJob,
    },
    /// Build the custom handler and zip it with its Functions host configuration
    FunctionPackage {
        /// Compilation target triple for the handler binary
        #[arg(long, default_value = "x86_64-unknown-linux-gnu")]
        target: String,
        /// Build profile used for the binary
        #[arg(value_enum, long, default_value_t = BuildProfile::Release)]
        profile: BuildProfile,
        /// App setting prefix that holds the storage connection
        #[arg(long, env = "BLOB_CONNECTION_SETTING", default_value = "PDFProcessorSTORAGE")]
        connection: String,
        /// Container watched by the blob trigger
        #[arg(long, default_value = "unprocessed-pdf")]
        source_container: String,
        /// Output directory for the zip
        #[arg(long, default_value = "dist")]
        output_dir: String,
    },
}

#[derive(Clone, ValueEnum)]
enum CiJob {
    /// Formatting, clippy, and tests
    Check,
    /// Tests only
    Test,
}

#[derive(Clone, Copy, ValueEnum)]
enum BuildProfile {
    Debug,
    Release,
}

impl BuildProfile {
    fn dir_name(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
        }
    }

    fn as_cargo_flag(self) -> Option<&'static str> {
        match self {
            Self::Debug => None,
            Self::Release => Some("--release"),
        }
    }
}

// ── helpers ────────────────────────────────────────────────────────

fn step(label: &str) {
    eprintln!("\n=== {label} ===");
}

fn cargo(args: &[&str]) -> ExitStatus {
    eprintln!("+ cargo {}", args.join(" "));
    Command::new("cargo")
        .args(args)
        .status()
        .expect("failed to execute cargo")
}

fn run_cargo(args: &[&str]) {
    let status = cargo(args);
    if !status.success() {
        exit(status.code().unwrap_or(1));
    }
}

struct PackageSpec<'a> {
    target: &'a str,
    profile: BuildProfile,
    connection: &'a str,
    source_container: &'a str,
    output_dir: &'a Path,
}

fn package_function_app(spec: &PackageSpec<'_>) {
    ensure_rust_target_installed(spec.target);

    step("Build custom handler binary");
    let mut cargo_args = vec![
        "build",
        "-p",
        FUNCTION_CRATE,
        "--target",
        spec.target,
        "--bin",
        HANDLER_BIN,
    ];
    if let Some(flag) = spec.profile.as_cargo_flag() {
        cargo_args.push(flag);
    }
    run_cargo(&cargo_args);

    step("Package function app zip");
    let target_dir = Path::new("target")
        .join(spec.target)
        .join(spec.profile.dir_name());
    fs::create_dir_all(spec.output_dir).expect("failed to create function dist directory");

    let executable = binary_name(HANDLER_BIN, spec.target);
    let zip_path = spec.output_dir.join(format!("{FUNCTION_NAME}.zip"));
    write_function_zip(
        &target_dir.join(&executable),
        &executable,
        &host_json(&executable),
        &function_json(spec.connection, spec.source_container),
        &zip_path,
    );

    eprintln!("\nPackaged artifact:\n- {}", zip_path.display());
}

fn ensure_rust_target_installed(target: &str) {
    let output = Command::new("rustup")
        .args(["target", "list", "--installed"])
        .output();

    let output = match output {
        Ok(value) => value,
        Err(error) => {
            eprintln!(
                "warning: failed to run `rustup target list --installed` ({error}); continuing without target preflight"
            );
            return;
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "failed to list installed rust targets; run `rustup target list --installed` manually. details: {}",
            stderr.trim()
        );
    }

    let installed = String::from_utf8_lossy(&output.stdout);
    if !installed.lines().any(|line| line.trim() == target) {
        panic!(
            "required rust target `{target}` is not installed. install it with `rustup target add {target}` and re-run `cargo run -p xtask -- function-package`"
        );
    }
}

fn binary_name(bin_name: &str, target: &str) -> String {
    if target.contains("windows") {
        format!("{bin_name}.exe")
    } else {
        bin_name.to_string()
    }
}

fn host_json(executable: &str) -> String {
    format!(
        r#"{{
  "version": "2.0",
  "logging": {{
    "applicationInsights": {{
      "samplingSettings": {{ "isEnabled": true, "excludedTypes": "Request" }}
    }}
  }},
  "extensionBundle": {{
    "id": "Microsoft.Azure.Functions.ExtensionBundle",
    "version": "[4.*, 5.0.0)"
  }},
  "customHandler": {{
    "description": {{
      "defaultExecutablePath": "{executable}",
      "workingDirectory": "",
      "arguments": []
    }},
    "enableForwardingHttpRequest": false
  }}
}}
"#
    )
}

fn function_json(connection: &str, source_container: &str) -> String {
    format!(
        r#"{{
  "bindings": [
    {{
      "name": "blob",
      "type": "blobTrigger",
      "direction": "in",
      "path": "{source_container}/{{name}}",
      "connection": "{connection}",
      "source": "EventGrid"
    }}
  ]
}}
"#
    )
}

fn write_function_zip(
    binary_path: &Path,
    executable: &str,
    host_json: &str,
    function_json: &str,
    zip_path: &Path,
) {
    if !binary_path.exists() {
        panic!("expected handler binary at '{}'", binary_path.display());
    }

    let binary = fs::read(binary_path).expect("failed to read handler binary");
    let file = fs::File::create(zip_path).expect("failed to create function zip");
    let mut zip = ZipWriter::new(file);
    let text = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let executable_options = text.unix_permissions(0o755);

    zip.start_file("host.json", text)
        .expect("failed to start host.json entry");
    zip.write_all(host_json.as_bytes())
        .expect("failed to write host.json entry");

    zip.start_file(format!("{FUNCTION_NAME}/function.json"), text)
        .expect("failed to start function.json entry");
    zip.write_all(function_json.as_bytes())
        .expect("failed to write function.json entry");

    zip.start_file(executable, executable_options)
        .expect("failed to start handler entry in function zip");
    zip.write_all(&binary)
        .expect("failed to write handler entry");
    zip.finish().expect("failed to finish function zip");
}

// ── CI jobs ────────────────────────────────────────────────────────

fn ci_check() {
    step("Check formatting");
    run_cargo(&["fmt", "--all", "--", "--check"]);

    step("Clippy");
    run_cargo(&[
        "clippy",
        "--all-targets",
        "--all-features",
        "--",
        "-D",
        "warnings",
    ]);

    ci_test();
}

fn ci_test() {
    step("Test blob_transfer_core");
    run_cargo(&["test", "-p", "blob_transfer_core"]);

    step("Test blob_transfer_function");
    run_cargo(&["test", "-p", FUNCTION_CRATE]);
}

// ── main ───────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            run_cargo(&["run", "-p", FUNCTION_CRATE, "--bin", HANDLER_BIN]);
        }
        Commands::Ci { job } => {
            match job {
                CiJob::Check => ci_check(),
                CiJob::Test => ci_test(),
            }
            eprintln!("\nCI job passed.");
        }
        Commands::FunctionPackage {
            target,
            profile,
            connection,
            source_container,
            output_dir,
        } => {
            package_function_app(&PackageSpec {
                target: &target,
                profile,
                connection: &connection,
                source_container: &source_container,
                output_dir: Path::new(&output_dir),
            });
        }
    }
}
