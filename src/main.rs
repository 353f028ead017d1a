#![warn(clippy::complexity)]
#![warn(clippy::correctness)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![warn(clippy::perf)]
#![warn(clippy::style)]
#![warn(clippy::suspicious)]
#![warn(clippy::missing_errors_doc)]
#![warn(clippy::missing_panics_doc)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::format_push_string)]
#![warn(clippy::get_unwrap)]
#![allow(clippy::missing_inline_in_public_items)]
#![allow(clippy::implicit_return)]
#![allow(clippy::blanket_clippy_restriction_lints)]
#![allow(clippy::pattern_type_mismatch)]

mod cache;
mod child;
mod childroot;
mod cli;
mod context;
mod emit;
mod error;
mod host_pm;
mod identity;
mod keyring;
mod namespace;
mod orchestrator;
mod pacman_config;
mod partition;
mod presets;
mod repo;
mod setup;
mod util;

use std::{
	fmt,
	time::SystemTime,
};

use clap::Parser;
use color_eyre::Result;
use tracing_subscriber::{
	fmt::{format, FmtContext, FormatEvent, FormatFields},
	prelude::*,
	registry::LookupSpan,
	EnvFilter, Registry,
};

use cli::Cli;

/// Renders every event on a single line as `[aimager:LEVEL] target@line:
/// message` (§6 "log format"), instead of the teacher's multi-line
/// `.pretty()` layout — aimager's output is meant to interleave cleanly
/// with the external collaborators' own stderr chatter.
struct AimagerLogFormat;

impl<S, N> FormatEvent<S, N> for AimagerLogFormat
where
	S: tracing::Subscriber + for<'a> LookupSpan<'a>,
	N: for<'a> FormatFields<'a> + 'static,
{
	fn format_event(
		&self, ctx: &FmtContext<'_, S, N>, mut writer: format::Writer<'_>, event: &tracing::Event<'_>,
	) -> fmt::Result {
		let metadata = event.metadata();
		write!(writer, "[aimager:{}] ", metadata.level())?;
		if let Some(line) = metadata.line() {
			write!(writer, "{}@{line}: ", metadata.module_path().unwrap_or_else(|| metadata.target()))?;
		} else {
			write!(writer, "{}: ", metadata.module_path().unwrap_or_else(|| metadata.target()))?;
		}
		ctx.field_format().format_fields(writer.by_ref(), event)?;
		writeln!(writer)
	}
}

fn main() -> Result<()> {
	if let Err(e) = dotenvy::dotenv() {
		if !e.not_found() {
			return Err(e.into());
		}
	}

	color_eyre::install()?;

	// aimager parses dates out of cache timestamps and package metadata;
	// forcing the C locale keeps that parsing independent of the caller's
	// environment (§6 env var notes).
	// SAFETY: called once at startup before any thread is spawned and
	// before anything reads LANG.
	unsafe {
		std::env::set_var("LANG", "C");
	}

	let filter = EnvFilter::try_from_env("AIMAGER_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
	let fmt_layer = tracing_subscriber::fmt::layer().event_format(AimagerLogFormat).with_filter(filter);
	let subscriber = Registry::default().with(tracing_error::ErrorLayer::default()).with(fmt_layer);
	tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

	let cli = Cli::parse();
	let start_time = SystemTime::now();

	if cli.internal_child {
		let context_path = cli
			.context_path
			.as_deref()
			.ok_or_else(|| error::AimagerError::configuration("--internal-child requires --context-path"))?;
		let ctx = orchestrator::load_context(context_path)?;
		tracing::info!(build_id = %ctx.build_id, "starting child-side build");
		return child::run(&ctx, start_time);
	}

	orchestrator::run(&cli, start_time)
}
