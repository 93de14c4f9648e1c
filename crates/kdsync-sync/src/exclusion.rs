//! Exclusion templates
//!
//! Glob-like name patterns (`*` is the only wildcard) deciding which items
//! are never synchronized. Templates come in two lists, the built-in
//! defaults and the user's own, and either list can be replaced at runtime
//! while observers and the reconciliation pass query the cache.
//!
//! Each template is compiled once per Unicode normalization form so that a
//! name matches whatever form the pattern or the filesystem used.

use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use kdsync_core::config::TemplateConfig;
use regex::Regex;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

use crate::io_helper::{IoHelper, LocalProbe};

/// Patterns shipped with the client
pub const DEFAULT_TEMPLATES: &[&str] = &[
    ".~lock.*",
    "~*.tmp",
    "*.~*",
    "Icon\r*",
    ".DS_Store",
    ".ds_store",
    "._*",
    "Thumbs.db",
    "System Volume Information",
    ".*.sw?",
    ".*.*sw?",
    ".TemporaryItems",
    ".Trashes",
    ".DocumentRevisions-V100",
    ".Trash-*",
    ".fseventd",
    ".apdisk",
    ".directory",
    "*.part",
    "*.filepart",
    "*.crdownload",
    "*.kate-swp",
    "*.gnucash.tmp-*",
    ".synkron.*",
    ".sync.ffs_db",
    ".symform",
    ".symform-store",
    ".fuse_hidden*",
    "*.unison",
    ".nfs*",
    "My Saved Places.",
    "*_conflict_*_*_*",
    "*~",
];

/// One exclusion rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionTemplate {
    pub pattern: String,
    /// Matching items are reported to the user instead of silently skipped
    pub warning: bool,
    /// Kept for display but no longer applied
    pub deleted: bool,
}

impl ExclusionTemplate {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            warning: false,
            deleted: false,
        }
    }

    #[must_use]
    pub fn with_warning(mut self, warning: bool) -> Self {
        self.warning = warning;
        self
    }
}

impl From<&TemplateConfig> for ExclusionTemplate {
    fn from(c: &TemplateConfig) -> Self {
        Self {
            pattern: c.pattern.clone(),
            warning: c.warning,
            deleted: c.deleted,
        }
    }
}

/// Why an item is excluded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
    /// The local item is hidden and hidden files are not synchronized
    Hidden,
    /// The name matches a template
    Template { pattern: String, warning: bool },
}

impl Exclusion {
    pub fn is_warning(&self) -> bool {
        matches!(self, Exclusion::Template { warning: true, .. })
    }
}

struct CompiledTemplate {
    template: ExclusionTemplate,
    /// One matcher per distinct normalization form
    matchers: Vec<Regex>,
}

#[derive(Default)]
struct Templates {
    defaults: Vec<ExclusionTemplate>,
    user: Vec<ExclusionTemplate>,
    compiled: Vec<CompiledTemplate>,
}

/// Shared, mutex-guarded set of compiled exclusion templates
pub struct ExclusionTemplateCache {
    inner: Mutex<Templates>,
}

impl Default for ExclusionTemplateCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ExclusionTemplateCache {
    /// Cache holding no template at all
    pub fn empty() -> Self {
        Self {
            inner: Mutex::new(Templates::default()),
        }
    }

    /// Cache holding [`DEFAULT_TEMPLATES`]
    pub fn with_defaults() -> Self {
        let cache = Self::empty();
        cache.update(
            true,
            DEFAULT_TEMPLATES.iter().map(|p| ExclusionTemplate::new(*p)).collect(),
        );
        cache
    }

    /// Default templates plus the user templates of the configuration
    pub fn from_config(user_templates: &[TemplateConfig]) -> Self {
        let cache = Self::with_defaults();
        cache.update(false, user_templates.iter().map(ExclusionTemplate::from).collect());
        cache
    }

    /// Replaces the default (`is_default`) or user list and recompiles
    pub fn update(&self, is_default: bool, templates: Vec<ExclusionTemplate>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if is_default {
            inner.defaults = templates;
        } else {
            inner.user = templates;
        }

        let compiled: Vec<CompiledTemplate> = inner
            .defaults
            .iter()
            .chain(inner.user.iter())
            .filter(|t| !t.deleted && !t.pattern.is_empty())
            .filter_map(compile)
            .collect();
        debug!(
            defaults = inner.defaults.len(),
            user = inner.user.len(),
            active = compiled.len(),
            "Exclusion templates updated"
        );
        inner.compiled = compiled;
    }

    /// Current list of `is_default` templates
    pub fn templates(&self, is_default: bool) -> Vec<ExclusionTemplate> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if is_default {
            inner.defaults.clone()
        } else {
            inner.user.clone()
        }
    }

    /// Matches a single name against every active template
    pub fn is_excluded(&self, name: &str) -> Option<Exclusion> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .compiled
            .iter()
            .find(|c| c.matchers.iter().any(|m| m.is_match(name)))
            .map(|c| Exclusion::Template {
                pattern: c.template.pattern.clone(),
                warning: c.template.warning,
            })
    }

    /// Matches the file name of a relative path
    pub fn is_excluded_path(&self, relative_path: &Path) -> Option<Exclusion> {
        let name = relative_path.file_name()?.to_string_lossy();
        self.is_excluded(&name)
    }

    /// Local-side check: hidden items first (unless `sync_hidden`), then templates
    ///
    /// # Errors
    ///
    /// Returns the I/O error raised while reading the item's attributes,
    /// e.g. `PermissionDenied` when a parent directory is not searchable.
    pub fn check_if_is_excluded(
        &self,
        base_path: &Path,
        relative_path: &Path,
        sync_hidden: bool,
    ) -> io::Result<Option<Exclusion>> {
        self.check_with_probe(&IoHelper, base_path, relative_path, sync_hidden)
    }

    pub(crate) fn check_with_probe(
        &self,
        probe: &dyn LocalProbe,
        base_path: &Path,
        relative_path: &Path,
        sync_hidden: bool,
    ) -> io::Result<Option<Exclusion>> {
        if !sync_hidden && !base_path.as_os_str().is_empty() {
            let absolute = base_path.join(relative_path);
            if probe.is_hidden(&absolute)? {
                debug!(path = %absolute.display(), "Item rejected because it is hidden");
                return Ok(Some(Exclusion::Hidden));
            }
        }
        Ok(self.is_excluded_path(relative_path))
    }
}

/// Escapes the regex metacharacters a template may contain, `*` excepted
fn escape(pattern: &str) -> String {
    const METACHARACTERS: &str = r"\.^$-+()[]{}|?";
    let mut out = String::with_capacity(pattern.len() * 2);
    for c in pattern.chars() {
        if METACHARACTERS.contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Turns a template into an anchored regular expression
fn to_regex(pattern: &str) -> String {
    let escaped = escape(pattern);
    let parts: Vec<&str> = escaped.split('*').filter(|p| !p.is_empty()).collect();

    let mut regex = String::from("^");
    if escaped.starts_with('*') {
        regex.push_str(".*?");
    }
    regex.push_str(&parts.join(".*?"));
    if escaped.ends_with('*') && !parts.is_empty() {
        regex.push_str(".*?");
    }
    regex.push('$');
    regex
}

fn compile(template: &ExclusionTemplate) -> Option<CompiledTemplate> {
    let mut forms: Vec<String> = vec![template.pattern.nfc().collect(), template.pattern.nfd().collect()];
    forms.dedup();

    let mut matchers = Vec::with_capacity(forms.len());
    for form in forms {
        match Regex::new(&to_regex(&form)) {
            Ok(re) => matchers.push(re),
            Err(e) => {
                warn!(pattern = %template.pattern, error = %e, "Ignoring invalid exclusion template");
                return None;
            }
        }
    }
    Some(CompiledTemplate {
        template: template.clone(),
        matchers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn user_cache(patterns: &[&str]) -> ExclusionTemplateCache {
        let cache = ExclusionTemplateCache::empty();
        cache.update(
            false,
            patterns.iter().map(|p| ExclusionTemplate::new(*p)).collect(),
        );
        cache
    }

    #[test]
    fn regex_translation() {
        assert_eq!(to_regex("Thumbs.db"), r"^Thumbs\.db$");
        assert_eq!(to_regex("*.part"), r"^.*?\.part$");
        assert_eq!(to_regex(".nfs*"), r"^\.nfs.*?$");
        assert_eq!(to_regex("*_conflict_*"), r"^.*?_conflict_.*?$");
    }

    #[test]
    fn exact_template_matches_whole_name_only() {
        let cache = user_cache(&["Thumbs.db"]);
        assert!(cache.is_excluded("Thumbs.db").is_some());
        assert!(cache.is_excluded("Thumbs.db.bak").is_none());
        assert!(cache.is_excluded("myThumbs.db").is_none());
    }

    #[test]
    fn wildcards_match_prefix_suffix_and_middle() {
        let cache = user_cache(&["*.part", ".nfs*", "a*b"]);
        assert!(cache.is_excluded("movie.part").is_some());
        assert!(cache.is_excluded(".nfs0001").is_some());
        assert!(cache.is_excluded("a-long-b").is_some());
        assert!(cache.is_excluded("a-long-bc").is_none());
        assert!(cache.is_excluded("movie.mp4").is_none());
    }

    #[test]
    fn question_mark_is_literal() {
        let cache = user_cache(&[".*.sw?"]);
        assert!(cache.is_excluded(".file.sw?").is_some());
        assert!(cache.is_excluded(".file.swp").is_none());
    }

    #[test]
    fn defaults_exclude_editor_leftovers() {
        let cache = ExclusionTemplateCache::with_defaults();
        assert!(cache.is_excluded(".DS_Store").is_some());
        assert!(cache.is_excluded("report.docx~").is_some());
        assert!(cache.is_excluded(".~lock.report.odt#").is_some());
        assert!(cache.is_excluded("report.docx").is_none());
    }

    #[test]
    fn matching_ignores_normalization_form() {
        let composed = "caf\u{e9}.txt";
        let decomposed = "cafe\u{301}.txt";

        let cache = user_cache(&[composed]);
        assert!(cache.is_excluded(composed).is_some());
        assert!(cache.is_excluded(decomposed).is_some());

        let cache = user_cache(&[decomposed]);
        assert!(cache.is_excluded(composed).is_some());
    }

    #[test]
    fn warning_flag_and_deleted_templates() {
        let cache = ExclusionTemplateCache::empty();
        let mut deleted = ExclusionTemplate::new("*.old");
        deleted.deleted = true;
        cache.update(
            false,
            vec![ExclusionTemplate::new("*.log").with_warning(true), deleted],
        );

        assert!(cache.is_excluded("a.log").is_some_and(|e| e.is_warning()));
        assert!(cache.is_excluded("a.old").is_none());
    }

    #[test]
    fn updating_user_list_keeps_defaults() {
        let cache = ExclusionTemplateCache::with_defaults();
        cache.update(false, vec![ExclusionTemplate::new("*.bak")]);
        assert!(cache.is_excluded("x.bak").is_some());
        assert!(cache.is_excluded(".DS_Store").is_some());
        assert_eq!(cache.templates(false).len(), 1);
    }

    #[test]
    fn path_check_uses_file_name() {
        let cache = user_cache(&["*.tmp"]);
        assert!(cache.is_excluded_path(&PathBuf::from("dir/x.tmp")).is_some());
        assert!(cache.is_excluded_path(&PathBuf::from("x.tmp/file")).is_none());
    }

    #[test]
    fn hidden_local_files_are_excluded_unless_synced() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(".hidden"), b"").unwrap();
        let cache = ExclusionTemplateCache::empty();

        let result = cache
            .check_if_is_excluded(dir.path(), Path::new(".hidden"), false)
            .unwrap();
        assert_eq!(result, Some(Exclusion::Hidden));

        let result = cache
            .check_if_is_excluded(dir.path(), Path::new(".hidden"), true)
            .unwrap();
        assert_eq!(result, None);
    }
}
