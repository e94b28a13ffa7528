//! Fan a batch of changes out to the applications that watch them.

use std::collections::HashMap;
use std::path::{Component, Path};

use pooldeploy_core::{ApplicationName, ApplicationSpec, ChangeRecord, ExcludeSet};

/// Per-application change lists produced for one batch.
pub type RoutedChanges = HashMap<ApplicationName, Vec<ChangeRecord>>;

#[derive(Debug, Clone)]
struct Route {
    application: ApplicationName,
    roots: Vec<Vec<String>>,
    exclude: ExcludeSet,
}

/// Matches changes against each enabled application's watch roots.
///
/// Roots match case-insensitively and by whole path components, so
/// `/src/app1` claims `/src/App1/x` but not `/src/app10/x`.
#[derive(Debug, Clone, Default)]
pub struct ApplicationRouter {
    routes: Vec<Route>,
}

impl ApplicationRouter {
    pub fn new<'a>(applications: impl IntoIterator<Item = &'a ApplicationSpec>) -> Self {
        let routes = applications
            .into_iter()
            .filter(|app| app.enabled)
            .map(|app| Route {
                application: app.name.clone(),
                roots: app.watch_roots.iter().map(|r| folded_components(r)).collect(),
                exclude: ExcludeSet::new(&app.exclude_patterns),
            })
            .collect();
        Self { routes }
    }

    /// Every application with at least one matching change gets its own copy
    /// of the matching records; the rest are absent from the result.
    pub fn route(&self, batch: &[ChangeRecord]) -> RoutedChanges {
        let mut routed = RoutedChanges::new();
        for route in &self.routes {
            let matching: Vec<ChangeRecord> = batch
                .iter()
                .filter(|change| route.claims(change))
                .cloned()
                .collect();
            if !matching.is_empty() {
                routed.insert(route.application.clone(), matching);
            }
        }
        routed
    }
}

impl Route {
    fn claims(&self, change: &ChangeRecord) -> bool {
        if self.exclude.is_excluded(&change.path) {
            return false;
        }
        // A file moved out of a watched tree still concerns that tree.
        self.is_watched(&change.path)
            || change
                .old_path
                .as_deref()
                .is_some_and(|old| self.is_watched(old))
    }

    fn is_watched(&self, path: &Path) -> bool {
        let path = folded_components(path);
        self.roots.iter().any(|root| path.starts_with(root))
    }
}

/// Case-insensitive prefix test on whole path components.
pub fn is_under_root(path: &Path, root: &Path) -> bool {
    folded_components(path).starts_with(&folded_components(root))
}

fn folded_components(path: &Path) -> Vec<String> {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
        .collect()
}
