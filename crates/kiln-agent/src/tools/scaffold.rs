use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SessionConfig;
use crate::errors::ToolError;
use crate::process::{CommandLine, ExecResult, run_command};
use crate::schema::{ArgType, ArgumentSchema};
use crate::truncation::{TruncationMode, truncate_chars};

use super::{
    NPM_INIT_TOOL, PLAYWRIGHT_INIT_TOOL, RegisteredTool, SUPERTEST_INIT_TOOL, ToolContext,
    ToolDefinition,
};

const PACKAGE_JSON: &str = "package.json";
const PLAYWRIGHT_CONFIG: &str = "playwright.config.js";
const INSTALL_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);
const INSTALL_OUTPUT_CHARS: usize = 2_000;

const PLAYWRIGHT_CONFIG_TEMPLATE: &str = r#"const { defineConfig } = require('@playwright/test');

module.exports = defineConfig({
  testDir: './tests',
  testMatch: '**/ui.test.js',
  timeout: 30000,
  retries: 0,
  workers: 1,
  reporter: 'list',
  use: {
    baseURL: 'http://localhost:3000',
    trace: 'on-first-retry',
    screenshot: 'only-on-failure',
    video: 'retain-on-failure',
  },
  projects: [
    {
      name: 'chromium',
      use: { browserName: 'chromium' },
    },
  ],
});
"#;

pub(super) fn npm_init_tool(config: &SessionConfig) -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            NPM_INIT_TOOL,
            "Create package.json for an Express app (express, express-handlebars, nodemon) and run the install.",
            ArgumentSchema::new()
                .optional("name", ArgType::String, "Package name.")
                .optional_with_default(
                    "overwrite",
                    ArgType::Boolean,
                    json!(false),
                    "Replace an existing package.json.",
                ),
        )
        .with_timeout(install_timeout(config, 1)),
        executor: Arc::new(|input, context| {
            Box::pin(async move {
                let path = guarded(&context, PACKAGE_JSON)?;
                let overwrite = input.optional_bool("overwrite").unwrap_or(false);
                if !overwrite && tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    return Err(ToolError::execution(
                        "package.json already exists; pass overwrite to replace it",
                    ));
                }

                let name = input
                    .optional_string("name")
                    .unwrap_or(&context.config.scaffold.package_name);
                let mut package = skeleton_package(name);
                merge_section(
                    &mut package,
                    "scripts",
                    &[("start", "node index.js"), ("dev", "nodemon index.js")],
                );
                merge_section(
                    &mut package,
                    "dependencies",
                    &[("express", "^4.18.2"), ("express-handlebars", "^7.1.2")],
                );
                merge_section(&mut package, "devDependencies", &[("nodemon", "^3.0.1")]);
                write_package(&path, &package).await?;

                let install = install(&context, NPM_INIT_TOOL, &context.config.scaffold.install_command).await?;
                Ok(json!({
                    "package_json": PACKAGE_JSON,
                    "install_output": install_output(&install),
                }))
            })
        }),
    }
}

pub(super) fn supertest_init_tool(config: &SessionConfig) -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            SUPERTEST_INIT_TOOL,
            "Add Jest and Supertest to package.json with API test scripts, then run the install.",
            ArgumentSchema::new(),
        )
        .with_timeout(install_timeout(config, 1)),
        executor: Arc::new(|_input, context| {
            Box::pin(async move {
                let path = guarded(&context, PACKAGE_JSON)?;
                let mut package = load_package(&path, &context.config.scaffold.package_name).await?;
                merge_section(
                    &mut package,
                    "devDependencies",
                    &[("jest", "^29.7.0"), ("supertest", "^6.3.3")],
                );
                merge_section(
                    &mut package,
                    "scripts",
                    &[
                        ("test", "jest tests/"),
                        ("test:api", "jest tests/api.test.js"),
                        ("test:watch", "jest tests/ --watch"),
                        ("test:coverage", "jest tests/ --coverage"),
                    ],
                );
                write_package(&path, &package).await?;

                let install =
                    install(&context, SUPERTEST_INIT_TOOL, &context.config.scaffold.install_command).await?;
                Ok(json!({
                    "package_json": PACKAGE_JSON,
                    "install_output": install_output(&install),
                }))
            })
        }),
    }
}

pub(super) fn playwright_init_tool(config: &SessionConfig) -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            PLAYWRIGHT_INIT_TOOL,
            "Write playwright.config.js, add Playwright to package.json with UI test scripts, install it and the Chromium browser.",
            ArgumentSchema::new(),
        )
        .with_timeout(install_timeout(config, 2)),
        executor: Arc::new(|_input, context| {
            Box::pin(async move {
                let config_path = guarded(&context, PLAYWRIGHT_CONFIG)?;
                let package_path = guarded(&context, PACKAGE_JSON)?;

                tokio::fs::write(&config_path, PLAYWRIGHT_CONFIG_TEMPLATE).await?;
                let mut package =
                    load_package(&package_path, &context.config.scaffold.package_name).await?;
                merge_section(&mut package, "devDependencies", &[("@playwright/test", "^1.40.0")]);
                merge_section(
                    &mut package,
                    "scripts",
                    &[
                        ("test:ui", "playwright test tests/ui.test.js"),
                        ("test:ui:headed", "playwright test tests/ui.test.js --headed"),
                        ("test:ui:debug", "playwright test tests/ui.test.js --debug"),
                    ],
                );
                write_package(&package_path, &package).await?;

                let scaffold = &context.config.scaffold;
                let install = install(&context, PLAYWRIGHT_INIT_TOOL, &scaffold.install_command).await?;

                // A missing browser does not undo the install; report it as data.
                let browsers = match run_command(
                    &scaffold.browser_install_command,
                    context.workspace.root(),
                    Duration::from_millis(scaffold.timeout_ms),
                )
                .await
                {
                    Ok(result) => json!({
                        "ok": result.succeeded(),
                        "exit_code": result.exit_code,
                        "output": install_output(&result),
                    }),
                    Err(err) => json!({ "ok": false, "error": err.to_string() }),
                };

                Ok(json!({
                    "config": PLAYWRIGHT_CONFIG,
                    "package_json": PACKAGE_JSON,
                    "install_output": install_output(&install),
                    "browsers": browsers,
                }))
            })
        }),
    }
}

fn install_timeout(config: &SessionConfig, installs: u32) -> Duration {
    Duration::from_millis(config.scaffold.timeout_ms) * installs + INSTALL_TIMEOUT_MARGIN
}

// Scaffold files go through the same checks as `fs.write`.
fn guarded(context: &ToolContext, relative: &str) -> Result<PathBuf, ToolError> {
    let path = context.workspace.resolve(relative)?;
    context.workspace.check_protected(&path)?;
    Ok(path)
}

fn skeleton_package(name: &str) -> Map<String, Value> {
    let package = json!({
        "name": name,
        "version": "1.0.0",
        "main": "index.js",
        "scripts": {},
        "dependencies": {},
        "devDependencies": {},
    });
    match package {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

async fn load_package(path: &Path, default_name: &str) -> Result<Map<String, Value>, ToolError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(skeleton_package(default_name));
        }
        Err(err) => return Err(err.into()),
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(package)) => Ok(package),
        Ok(_) => Err(ToolError::execution("package.json is not a JSON object")),
        Err(err) => Err(ToolError::execution(format!("package.json is not valid JSON: {err}"))),
    }
}

fn merge_section(package: &mut Map<String, Value>, section: &str, entries: &[(&str, &str)]) {
    let slot = package
        .entry(section)
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    if let Value::Object(map) = slot {
        for (key, value) in entries {
            map.insert((*key).to_string(), Value::String((*value).to_string()));
        }
    }
}

async fn write_package(path: &Path, package: &Map<String, Value>) -> Result<(), ToolError> {
    let mut text = serde_json::to_string_pretty(package)
        .map_err(|err| ToolError::execution(format!("cannot encode package.json: {err}")))?;
    text.push('\n');
    tokio::fs::write(path, text).await?;
    Ok(())
}

async fn install(context: &ToolContext, tool: &str, command: &CommandLine) -> Result<ExecResult, ToolError> {
    let timeout_ms = context.config.scaffold.timeout_ms;
    let result = run_command(command, context.workspace.root(), Duration::from_millis(timeout_ms)).await?;
    if result.timed_out {
        return Err(ToolError::Timeout {
            tool: tool.to_string(),
            timeout_ms,
        });
    }
    if !result.succeeded() {
        return Err(ToolError::execution(format!(
            "'{command}' failed with exit code {}: {}",
            result
                .exit_code
                .map_or_else(|| "none".to_string(), |code| code.to_string()),
            truncate_chars(result.stderr.trim(), INSTALL_OUTPUT_CHARS, TruncationMode::Tail)
        )));
    }
    Ok(result)
}

fn install_output(result: &ExecResult) -> String {
    truncate_chars(result.stdout.trim(), INSTALL_OUTPUT_CHARS, TruncationMode::Tail)
}
