//! # netqueue — 命令行演示入口
//!
//! 本文件仅负责日志初始化、参数解析与结果打印。
//! 调度与解码逻辑分布在各库模块中，详见 `lib.rs` 架构文档。
//!
//! 用法：`netqueue [--text|--json|--xml|--envelope] [--config <file>] <url>`

use std::process::ExitCode;

use netqueue::request::{Method, Request, XmlEvent};
use netqueue::{Dispatcher, DispatcherConfig, RequestError};

const USAGE: &str = "用法：netqueue [--text|--json|--xml|--envelope] [--config <file>] <url>";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Text,
    Json,
    Xml,
    Envelope,
}

struct Args {
    mode: Mode,
    config: Option<String>,
    url: String,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut mode = Mode::Text;
    let mut config = None;
    let mut url = None;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--text" => mode = Mode::Text,
            "--json" => mode = Mode::Json,
            "--xml" => mode = Mode::Xml,
            "--envelope" => mode = Mode::Envelope,
            "--config" => config = Some(args.next().ok_or("--config 需要文件路径")?),
            other if other.starts_with("--") => return Err(format!("未知参数：{}", other)),
            other => url = Some(other.to_string()),
        }
    }

    Ok(Args {
        mode,
        config,
        url: url.ok_or("缺少 URL")?,
    })
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => DispatcherConfig::from_json_file(path)?,
        None => DispatcherConfig::default(),
    };
    let dispatcher = Dispatcher::with_http(config)?;

    match args.mode {
        Mode::Text => {
            let body = dispatcher.submit(Request::text(Method::Get, &args.url)).wait_blocking()?;
            println!("{}", body);
        }
        Mode::Json => {
            let value = dispatcher
                .submit(Request::json_value(Method::Get, &args.url))
                .wait_blocking()?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Mode::Xml => {
            let cursor = dispatcher.submit(Request::xml(Method::Get, &args.url)).wait_blocking()?;
            let mut depth = 0usize;
            for event in cursor {
                match event? {
                    XmlEvent::StartTag { name, attributes } => {
                        println!("{}<{}> {:?}", "  ".repeat(depth), name, attributes);
                        depth += 1;
                    }
                    XmlEvent::EndTag { .. } => depth = depth.saturating_sub(1),
                    XmlEvent::Text(text) => println!("{}{}", "  ".repeat(depth), text),
                    XmlEvent::EndDocument => break,
                }
            }
        }
        Mode::Envelope => {
            let envelope = dispatcher
                .submit(Request::envelope(Method::Get, &args.url))
                .wait_blocking()?;
            println!("error_code={} reason={}", envelope.error_code(), envelope.reason());
            let payload: Result<String, RequestError> = envelope.into_result();
            println!("{}", payload?);
        }
    }

    dispatcher.shutdown();
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}\n{}", message, USAGE);
            return ExitCode::from(2);
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            log::error!("❌ 请求失败：{}", error);
            ExitCode::FAILURE
        }
    }
}
