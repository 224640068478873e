//! Build script for reactor-runtime
//!
//! Handles configuration merging:
//! 1. Start with library defaults
//! 2. If RCT_CONFIG_RS env var is set, parse the user's config file
//! 3. Merge user values over defaults (user wins)
//! 4. Generate OUT_DIR/rct_merged_config.rs
//!
//! The user file only needs the values it wants to change.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

/// Configuration parameter definition
struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
}

/// All configuration parameters with their defaults
const CONFIG_PARAMS: &[ConfigParam] = &[
    // 0 = one shard per CPU in the allowed set
    ConfigParam { name: "SMP", rust_type: "usize", default_value: "0" },
    ConfigParam { name: "THREAD_AFFINITY", rust_type: "bool", default_value: "true" },
    ConfigParam { name: "TASK_QUOTA_US", rust_type: "u64", default_value: "2000" },
    ConfigParam { name: "BLOCKED_REACTOR_NOTIFY_MS", rust_type: "u64", default_value: "2000" },
    ConfigParam { name: "BLOCKED_REACTOR_REPORTS_PER_MINUTE", rust_type: "u32", default_value: "5" },
    ConfigParam { name: "MAX_TASK_BACKLOG", rust_type: "usize", default_value: "1000" },
    ConfigParam { name: "IDLE_POLL_TIME_US", rust_type: "u64", default_value: "200" },
    ConfigParam { name: "VIRTUALIZED_IDLE_POLL_TIME_US", rust_type: "u64", default_value: "2000" },
    ConfigParam { name: "POLL_MODE", rust_type: "bool", default_value: "false" },
    // 0 = 128 per io queue
    ConfigParam { name: "MAX_IO_REQUESTS", rust_type: "usize", default_value: "0" },
    // 0 = one io queue per shard
    ConfigParam { name: "NUM_IO_QUEUES", rust_type: "usize", default_value: "0" },
    ConfigParam { name: "RELAXED_DMA", rust_type: "bool", default_value: "false" },
    ConfigParam { name: "IO_BACKEND", rust_type: "&str", default_value: "\"auto\"" },
    ConfigParam { name: "MAX_AIO", rust_type: "usize", default_value: "128" },
    ConfigParam { name: "SMP_QUEUE_LENGTH", rust_type: "usize", default_value: "128" },
    ConfigParam { name: "SMP_BATCH_SIZE", rust_type: "usize", default_value: "16" },
    ConfigParam { name: "SYSCALL_QUEUE_LENGTH", rust_type: "usize", default_value: "128" },
    ConfigParam { name: "SLOPPY_GROWTH_FACTOR", rust_type: "u64", default_value: "2" },
    ConfigParam { name: "BYPASS_FSYNC", rust_type: "bool", default_value: "false" },
    ConfigParam { name: "HANDLE_SIGINT", rust_type: "bool", default_value: "true" },
    ConfigParam { name: "LOWRES_GRANULARITY_MS", rust_type: "u64", default_value: "10" },
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest_path = Path::new(&out_dir).join("rct_merged_config.rs");

    let mut config: HashMap<&str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    if let Ok(user_path) = env::var("RCT_CONFIG_RS") {
        println!("cargo:rerun-if-changed={}", user_path);

        match fs::read_to_string(&user_path) {
            Ok(content) => {
                parse_and_merge(&content, &mut config);
                println!("cargo:warning=Using custom reactor config: {}", user_path);
            }
            Err(e) => {
                println!(
                    "cargo:warning=Failed to read RCT_CONFIG_RS ({}): {}",
                    user_path, e
                );
            }
        }
    }

    println!("cargo:rerun-if-env-changed=RCT_CONFIG_RS");
    println!("cargo:rerun-if-changed=build.rs");

    let output = generate_config(&config);
    fs::write(&dest_path, output).expect("Failed to write merged config");
}

/// Parse the user's config file and merge known values into `config`.
fn parse_and_merge(content: &str, config: &mut HashMap<&str, String>) {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") || !line.starts_with("pub const ") {
            continue;
        }

        let Some((name, value)) = parse_const_line(line) else {
            continue;
        };
        match CONFIG_PARAMS.iter().find(|p| p.name == name) {
            Some(param) => {
                config.insert(param.name, value);
            }
            None => println!("cargo:warning=Unknown reactor config parameter: {}", name),
        }
    }
}

/// Parse `pub const NAME: TYPE = VALUE;` into (NAME, VALUE).
fn parse_const_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?.trim();

    let colon_pos = rest.find(':')?;
    let name = rest[..colon_pos].trim().to_string();

    let eq_pos = rest.find('=')?;
    let semi_pos = rest.rfind(';').unwrap_or(rest.len());
    let value = rest[eq_pos + 1..semi_pos].trim().to_string();

    Some((name, value))
}

/// Generate the merged config Rust file
fn generate_config(config: &HashMap<&str, String>) -> String {
    let mut output = String::new();

    output.push_str("// Auto-generated by build.rs - do not edit\n");
    output.push_str("// Reactor defaults");
    if env::var("RCT_CONFIG_RS").is_ok() {
        output.push_str(" merged with the user's rct_config.rs");
    }
    output.push_str("\n\n");

    for param in CONFIG_PARAMS {
        let value = config
            .get(param.name)
            .map(String::as_str)
            .unwrap_or(param.default_value);
        let ty = if param.rust_type == "&str" { "&'static str" } else { param.rust_type };
        output.push_str(&format!("pub const {}: {} = {};\n", param.name, ty, value));
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_const_line() {
        let result = parse_const_line("pub const SMP: usize = 8;");
        assert_eq!(result, Some(("SMP".into(), "8".into())));

        let result = parse_const_line("pub const IO_BACKEND: &str = \"threaded\";");
        assert_eq!(result, Some(("IO_BACKEND".into(), "\"threaded\"".into())));
    }

    #[test]
    fn test_unknown_params_are_ignored() {
        let mut config: HashMap<&str, String> = HashMap::new();
        config.insert("TASK_QUOTA_US", "2000".into());

        let user_config = r#"
            // tighter quota
            pub const TASK_QUOTA_US: u64 = 500;
            pub const NOT_A_PARAM: u64 = 1;
        "#;
        parse_and_merge(user_config, &mut config);

        assert_eq!(config.get("TASK_QUOTA_US"), Some(&"500".to_string()));
        assert!(!config.contains_key("NOT_A_PARAM"));
    }
}
