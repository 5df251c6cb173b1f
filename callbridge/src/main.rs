//! callbridge-call: drive a worker pool from JSON lines.
//!
//! Reads `{"function": ..., "argument": ...}` lines on stdin and writes one
//! `{"ok": value}` or `{"error": "message"}` line per request, in input order.

use std::ffi::OsString;
use std::process::ExitCode;

use anyhow::Context;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use callbridge::{CommandSpawner, DEFAULT_MAX_FRAME_LENGTH, PoolConfig, Value, WorkerPool};

const USAGE: &str = "\
Usage: callbridge-call [--workers N] [--max-frame-bytes N] -- <program> [args...]

Options:
  --workers <n>           Worker processes to start [default: available CPUs]
  --max-frame-bytes <n>   Largest frame accepted or sent [default: 268435456]";

#[derive(Debug, PartialEq)]
struct Options {
    workers: usize,
    max_frame_bytes: usize,
    program: OsString,
    args: Vec<OsString>,
}

#[derive(Debug, Deserialize)]
struct CallLine {
    function: String,
    #[serde(default)]
    argument: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum Outcome {
    Ok(serde_json::Value),
    Error(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    callbridge::init_tracing();

    match run(options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut workers = None;
    let mut max_frame_bytes = DEFAULT_MAX_FRAME_LENGTH;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--workers" => {
                i += 1;
                let value = args.get(i).ok_or("--workers requires a value")?;
                workers = Some(parse_positive(value, "--workers")?);
            }
            "--max-frame-bytes" => {
                i += 1;
                let value = args.get(i).ok_or("--max-frame-bytes requires a value")?;
                max_frame_bytes = parse_positive(value, "--max-frame-bytes")?;
            }
            "--help" | "-h" => return Err(String::new()),
            "--" => {
                i += 1;
                break;
            }
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    let mut command = args.iter().skip(i).map(OsString::from);
    let program = command
        .next()
        .ok_or("missing worker command after --")?;

    let workers = workers.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1)
    });

    Ok(Options {
        workers,
        max_frame_bytes,
        program,
        args: command.collect(),
    })
}

fn parse_positive(value: &str, flag: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err(format!("{flag} must be positive")),
        Ok(n) => Ok(n),
        Err(e) => Err(format!("invalid {flag} value '{value}': {e}")),
    }
}

async fn run(options: Options) -> anyhow::Result<()> {
    let spawner = CommandSpawner::new(&options.program).with_args(&options.args);
    let config = PoolConfig::new(options.workers).with_max_frame_length(options.max_frame_bytes);
    let pool = WorkerPool::start(&spawner, &config)
        .with_context(|| format!("failed to start {:?}", options.program))?;

    let lines = futures::stream::unfold(
        BufReader::new(tokio::io::stdin()).lines(),
        |mut lines| async move { lines.next_line().await.transpose().map(|line| (line, lines)) },
    );

    // Up to one request per worker in flight; `buffered` keeps output in input order.
    {
        let pool_ref = &pool;
        let outcomes = lines
            .map(move |line| async move {
                match line {
                    Ok(line) if line.trim().is_empty() => Ok(None),
                    Ok(line) => Ok(Some(handle_line(pool_ref, &line).await)),
                    Err(e) => Err(e),
                }
            })
            .buffered(options.workers);
        let mut outcomes = std::pin::pin!(outcomes);

        let mut stdout = tokio::io::stdout();
        while let Some(outcome) = outcomes.next().await {
            let Some(outcome) = outcome.context("failed to read stdin")? else {
                continue;
            };
            let mut line = serde_json::to_string(&outcome)?;
            line.push('\n');
            stdout.write_all(line.as_bytes()).await?;
            stdout.flush().await?;
        }
    }

    let live = pool.live();
    pool.shutdown().await;
    if live == 0 {
        anyhow::bail!("all workers exited");
    }
    Ok(())
}

async fn handle_line(pool: &WorkerPool, line: &str) -> Outcome {
    let call: CallLine = match serde_json::from_str(line) {
        Ok(call) => call,
        Err(e) => return Outcome::Error(format!("invalid request line: {e}")),
    };
    let argument = match Value::from_json(&call.argument) {
        Ok(argument) => argument,
        Err(e) => return Outcome::Error(format!("invalid argument: {e}")),
    };

    match pool.call(&call.function, argument).await {
        Ok(value) => Outcome::Ok(value.to_json()),
        Err(e) => {
            tracing::debug!(function = %call.function, error = %e, "Call failed");
            Outcome::Error(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("callbridge-call")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_flags_and_command() {
        let options = parse_args(&argv(&[
            "--workers",
            "3",
            "--max-frame-bytes",
            "1024",
            "--",
            "worker",
            "--verbose",
        ]))
        .unwrap();
        assert_eq!(
            options,
            Options {
                workers: 3,
                max_frame_bytes: 1024,
                program: "worker".into(),
                args: vec!["--verbose".into()],
            }
        );
    }

    #[test]
    fn command_is_required() {
        assert_eq!(
            parse_args(&argv(&["--workers", "2"])).unwrap_err(),
            "missing worker command after --"
        );
        assert!(parse_args(&argv(&["--"])).is_err());
    }

    #[test]
    fn rejects_bad_flags() {
        assert!(parse_args(&argv(&["--workers", "0", "--", "w"])).is_err());
        assert!(parse_args(&argv(&["--workers"])).is_err());
        assert_eq!(
            parse_args(&argv(&["--bogus", "--", "w"])).unwrap_err(),
            "unexpected argument: --bogus"
        );
    }

    #[test]
    fn outcome_lines() {
        insta::assert_snapshot!(
            serde_json::to_string(&Outcome::Ok(serde_json::json!({"result": 7}))).unwrap(),
            @r#"{"ok":{"result":7}}"#
        );
        insta::assert_snapshot!(
            serde_json::to_string(&Outcome::Error("unknown function 'x'".into())).unwrap(),
            @r#"{"error":"unknown function 'x'"}"#
        );
    }

    #[test]
    fn call_line_argument_defaults_to_null() {
        let call: CallLine = serde_json::from_str(r#"{"function": "f"}"#).unwrap();
        assert_eq!(call.function, "f");
        assert!(call.argument.is_null());
    }
}
