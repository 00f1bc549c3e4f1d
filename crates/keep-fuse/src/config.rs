use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};

use crate::node::{DEFAULT_POLL_INTERVAL, DirectoryKind};
use crate::ops::Layout;

/// Which directory the mount root shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LayoutArg {
    /// `by_id`, `by_tag` and `groups` under one root
    Home,
    /// Collections by locator, materialized on lookup
    ById,
    /// Collections grouped by tag
    ByTag,
    /// Groups and their contents
    Groups,
    /// A single collection (needs --collection)
    Collection,
}

#[derive(Debug, Clone)]
pub struct MountConfig {
    pub mount_point: PathBuf,
    pub keep_dir: Option<PathBuf>,
    pub metadata: Option<PathBuf>,
    pub layout: LayoutArg,
    pub collection: Option<String>,
    pub poll_interval: Duration,
    pub allow_other: bool,
    pub auto_unmount: bool,
    pub log_level: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from("/keep"),
            keep_dir: None,
            metadata: None,
            layout: LayoutArg::Home,
            collection: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            allow_other: false,
            auto_unmount: true,
            log_level: "info".into(),
        }
    }
}

impl MountConfig {
    /// The root layout, or `None` when the `collection` layout has no
    /// locator.
    pub fn layout(&self) -> Option<Layout> {
        let kind = match self.layout {
            LayoutArg::Home => return Some(Layout::Home),
            LayoutArg::ById => DirectoryKind::Magic,
            LayoutArg::ByTag => DirectoryKind::Tags,
            LayoutArg::Groups => DirectoryKind::Groups,
            LayoutArg::Collection => DirectoryKind::Collection {
                locator: self.collection.clone()?,
            },
        };
        Some(Layout::Single(kind))
    }
}

#[derive(Parser)]
#[command(name = "keep-fuse", about = "Keep collections as a read-only FUSE filesystem")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Mount the filesystem
    Mount {
        /// Mount point path
        path: PathBuf,
        /// Directory of data blocks, each file named by its locator
        #[arg(long)]
        keep_dir: Option<PathBuf>,
        /// JSON file with links, groups and group contents
        #[arg(long)]
        metadata: Option<PathBuf>,
        /// What the mount root shows
        #[arg(long, value_enum, default_value_t = LayoutArg::Home)]
        layout: LayoutArg,
        /// Collection locator for the `collection` layout
        #[arg(long)]
        collection: Option<String>,
        /// Seconds between refreshes when change notifications are unavailable
        #[arg(long, default_value_t = 60)]
        poll_interval: u64,
        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
        /// Automatically unmount when the process exits (true|false)
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        auto_unmount: bool,
        /// Log level (trace, debug, info, warn, error)
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Unmount the filesystem
    Unmount {
        /// Mount point path
        path: PathBuf,
    },
    /// Show mount status
    Status {
        /// Mount point path
        path: PathBuf,
    },
}
