// Copyright (c) 2025 Zensical and contributors

// SPDX-License-Identifier: MIT
// Third-party contributions licensed under DCO

// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to
// deal in the Software without restriction, including without limitation the
// rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
// sell copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:

// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NON-INFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
// IN THE SOFTWARE.

// ----------------------------------------------------------------------------
//! Command line interface.

use clap::Parser;
use crossbeam::channel::unbounded;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use treewatch::{Action, Event, Opt, WatchOptions, Watcher};

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Watch directories and print every change.
#[derive(Debug, Parser)]
#[clap(name = "treewatch", version, about, long_about = None)]
struct Args {
    /// Directories to watch.
    #[clap(required = true, value_name = "DIR")]
    paths: Vec<PathBuf>,

    /// Watch subdirectories as well.
    #[clap(short, long)]
    recursive: bool,

    /// Use the polling backend, e.g., for network file systems.
    #[clap(short, long)]
    generic: bool,

    /// Follow symbolic links to directories.
    #[clap(long)]
    follow_symlinks: bool,

    /// Allow followed links to point outside of the watched directory.
    #[clap(long)]
    allow_out_of_scope_links: bool,

    /// Collapse duplicate and contradictory events.
    #[clap(long)]
    sanitize: bool,

    /// Don't backfill events for contents of new directories.
    #[clap(long)]
    no_synthetic: bool,

    /// Window for batching events in milliseconds.
    #[clap(long, value_name = "MS", default_value = "20")]
    batch_window_ms: u64,

    /// Interval of the polling backend in milliseconds.
    #[clap(long, value_name = "MS", default_value = "1000")]
    poll_interval_ms: u64,
}

// ----------------------------------------------------------------------------
// Program
// ----------------------------------------------------------------------------

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("treewatch: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Watches the directories given on the command line, until the watcher
/// terminates or every watch is gone.
fn run(args: &Args) -> treewatch::Result {
    let mut watcher = Watcher::builder()
        .generic(args.generic)
        .follow_symlinks(args.follow_symlinks)
        .allow_out_of_scope_links(args.allow_out_of_scope_links)
        .batch_window(Duration::from_millis(args.batch_window_ms))
        .poll_interval(Duration::from_millis(args.poll_interval_ms))
        .build()?;

    // Forward events from the background thread to the main thread
    let (sender, receiver) = unbounded();
    let mut options = WatchOptions::new();
    if args.sanitize {
        options.set(Opt::SanitizeEvents, 1);
    }
    if args.no_synthetic {
        options.set(Opt::SyntheticEvents, 0);
    }
    for path in &args.paths {
        let sender = sender.clone();
        let id = watcher.add_watch_with_options(
            path,
            args.recursive,
            move |event: &Event| {
                let _ = sender.send(event.clone());
            },
            options.clone(),
        )?;
        tracing::info!(%id, ?path, "watching");
    }
    drop(sender);
    watcher.watch()?;

    // Print events until all watches are gone
    for event in receiver {
        println!("{}", format(&event));
        if watcher.directories().is_empty() {
            break;
        }
    }
    Ok(())
}

/// Formats an event for printing.
fn format(event: &Event) -> String {
    let action = match event.action {
        Action::Add => "add",
        Action::Delete => "delete",
        Action::Modified => "modified",
        Action::Moved => "moved",
    };
    match event.old_path() {
        Some(old) => format!(
            "[{}] {action} {} -> {}",
            event.id,
            old.display(),
            event.path().display()
        ),
        None => format!("[{}] {action} {}", event.id, event.path().display()),
    }
}
