//! Helpers for building and converting LSP payloads.
//!
//! The LSP data shapes themselves (positions, locations, capabilities,
//! completion/hover/definition/reference results) come from `lsp-types`;
//! this module holds the client capability announcement and the
//! conversions the binary needs between user-facing paths/positions and
//! their LSP forms.

use std::path::Path;

use lsp_types::{
    ClientCapabilities, CompletionClientCapabilities, CompletionItemCapability,
    DynamicRegistrationClientCapabilities, GotoCapability, HoverClientCapabilities, MarkupKind,
    Position, TextDocumentClientCapabilities, TextDocumentSyncClientCapabilities, Url,
    WorkspaceClientCapabilities, WorkspaceEditClientCapabilities,
};

use crate::config::LanguageServerConfig;
use crate::error::LspError;

use super::LspResult;

/// Builds the capabilities announced in the `initialize` request.
///
/// Completion, hover, definition and references are only announced when
/// enabled in `config`.
pub fn client_capabilities(config: &LanguageServerConfig) -> ClientCapabilities {
    let markup = || Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]);

    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            apply_edit: Some(true),
            workspace_edit: Some(WorkspaceEditClientCapabilities {
                document_changes: Some(true),
                ..Default::default()
            }),
            did_change_configuration: Some(DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(true),
            }),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                dynamic_registration: Some(true),
                will_save: Some(true),
                will_save_wait_until: Some(true),
                did_save: Some(true),
            }),
            completion: config
                .enable_completion
                .then(|| CompletionClientCapabilities {
                    dynamic_registration: Some(true),
                    completion_item: Some(CompletionItemCapability {
                        snippet_support: Some(true),
                        commit_characters_support: Some(true),
                        documentation_format: markup(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            hover: config.enable_hover.then(|| HoverClientCapabilities {
                dynamic_registration: Some(true),
                content_format: markup(),
            }),
            definition: config.enable_definition.then_some(GotoCapability {
                dynamic_registration: Some(true),
                link_support: Some(true),
            }),
            references: config
                .enable_references
                .then_some(DynamicRegistrationClientCapabilities {
                    dynamic_registration: Some(true),
                }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Converts a path to an LSP file:// URI.
///
/// Relative paths are resolved against the current directory and the result
/// is canonicalized, so the path must exist.
/// ## Errors
pub fn path_to_url(path: &Path) -> LspResult<Url> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| LspError::InvalidPath(format!("failed to get current directory: {e}")))?
            .join(path)
    };

    let canonical = absolute.canonicalize().map_err(|e| {
        LspError::InvalidPath(format!(
            "failed to canonicalize path '{}': {}",
            path.display(),
            e
        ))
    })?;

    Url::from_file_path(&canonical)
        .map_err(|()| LspError::InvalidPath(format!("invalid path: {}", canonical.display())))
}

/// Converts user-facing 1-indexed position to LSP 0-indexed position.
///
/// # Errors
///
/// Returns error if line or column is 0.
pub fn to_lsp_position(line: u32, column: u32) -> LspResult<Position> {
    if line == 0 || column == 0 {
        return Err(LspError::InvalidPosition { line, column });
    }
    Ok(Position {
        line: line - 1,
        character: column - 1,
    })
}

/// Converts LSP 0-indexed position to user-facing 1-indexed position.
pub fn from_lsp_position(position: Position) -> (u32, u32) {
    (position.line + 1, position.character + 1)
}
