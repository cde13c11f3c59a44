//! Terminal folder topology
//!
//! A terminal exports into one or more named folders on the transfer server.
//! Each folder is an independent export stream: requests are written under the
//! request root, exports are read from the response root.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TxloadError};

/// Name of the outbound command file inside every request folder.
pub const REQUEST_FILE_NAME: &str = "request.txt";

/// One logical export stream of a terminal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerminalFolder {
    /// Terminal code, e.g. "T01"
    pub terminal_code: String,

    /// Folder name under the terminal, e.g. "main"
    pub folder_name: String,

    /// `{request_root}/{terminal}/{folder}`
    pub request_path: String,

    /// `{response_root}/{terminal}/{folder}`
    pub response_path: String,
}

impl TerminalFolder {
    pub fn new(
        terminal_code: impl Into<String>,
        folder_name: impl Into<String>,
        request_root: &str,
        response_root: &str,
    ) -> Self {
        let terminal_code = terminal_code.into();
        let folder_name = folder_name.into();
        let request_path = join_path(&[request_root, &terminal_code, &folder_name]);
        let response_path = join_path(&[response_root, &terminal_code, &folder_name]);

        Self {
            terminal_code,
            folder_name,
            request_path,
            response_path,
        }
    }

    /// Parse a single `TERMINAL/FOLDER` entry
    pub fn parse(entry: &str, request_root: &str, response_root: &str) -> Result<Self> {
        let entry = entry.trim();
        match entry.split_once('/') {
            Some((terminal, folder))
                if !terminal.trim().is_empty()
                    && !folder.trim().is_empty()
                    && !folder.contains('/') =>
            {
                Ok(Self::new(terminal.trim(), folder.trim(), request_root, response_root))
            },
            _ => Err(TxloadError::InvalidFolder(entry.to_string())),
        }
    }

    /// Parse a comma-separated topology list such as `T01/main,T01/backup,T02/main`
    ///
    /// Empty entries are ignored; duplicates are an error.
    pub fn parse_list(list: &str, request_root: &str, response_root: &str) -> Result<Vec<Self>> {
        let mut folders: Vec<Self> = Vec::new();

        for entry in list.split(',').filter(|e| !e.trim().is_empty()) {
            let folder = Self::parse(entry, request_root, response_root)?;
            if folders.iter().any(|f| f.source_tag() == folder.source_tag()) {
                return Err(TxloadError::Config(format!(
                    "terminal folder '{}' is listed twice",
                    folder.source_tag()
                )));
            }
            folders.push(folder);
        }

        Ok(folders)
    }

    /// Folder key written into every record's `source_folder` column
    pub fn source_tag(&self) -> String {
        format!("{}/{}", self.terminal_code, self.folder_name)
    }

    /// Full path of the outbound request file
    pub fn request_file(&self) -> String {
        join_path(&[&self.request_path, REQUEST_FILE_NAME])
    }

    /// Full path of an inbound file in the response folder
    pub fn response_file(&self, name: &str) -> String {
        join_path(&[&self.response_path, name])
    }
}

/// Join transfer-server path segments with single slashes.
///
/// A leading slash on the first segment is kept so absolute roots stay absolute.
pub fn join_path(segments: &[&str]) -> String {
    let absolute = segments.first().is_some_and(|s| s.starts_with('/'));
    let body = segments
        .iter()
        .flat_map(|s| s.split('/'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/");

    if absolute {
        format!("/{}", body)
    } else {
        body
    }
}
