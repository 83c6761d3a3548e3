use crate::error::ProfileError;
use crate::profile::{load, DeviceProfile, ProfileSource};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Profiles compiled into the crate, keyed by model identifier
const BUILTIN: &[(&str, &str)] = &[(
    "ecam-espresso",
    include_str!("../profiles/ecam-espresso.json"),
)];

/// JSON text of a built-in profile
pub(crate) fn builtin(id: &str) -> Option<&'static str> {
    BUILTIN
        .iter()
        .find(|(model, _)| *model == id)
        .map(|(_, text)| *text)
}

/// Identifiers of all built-in profiles
pub fn builtin_models() -> Vec<&'static str> {
    BUILTIN.iter().map(|(model, _)| *model).collect()
}

/// Loaded profiles, one shared instance per model
///
/// Build one at startup and hand it to each [`Device`](crate::Device); every
/// appliance of the same model then reads the same immutable profile.
#[derive(Debug, Clone, Default)]
pub struct ProfileRepository {
    profiles: HashMap<String, Arc<DeviceProfile>>,
}

impl ProfileRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a repository holding every built-in profile
    pub fn with_builtin() -> Result<Self, ProfileError> {
        let mut repo = Self::new();
        for (model, _) in BUILTIN {
            repo.insert(load(ProfileSource::Builtin(model))?);
        }
        Ok(repo)
    }

    /// Add a profile, replacing any previous profile for the same model
    pub fn insert(&mut self, profile: DeviceProfile) -> Arc<DeviceProfile> {
        let profile = Arc::new(profile);
        if self
            .profiles
            .insert(profile.model.clone(), profile.clone())
            .is_some()
        {
            tracing::debug!("Replaced profile for model {}", profile.model);
        }
        profile
    }

    /// Load one profile document from disk
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<Arc<DeviceProfile>, ProfileError> {
        let profile = load(ProfileSource::Path(path.as_ref()))?;
        tracing::info!(model = %profile.model, path = %path.as_ref().display(), "Loaded device profile");
        Ok(self.insert(profile))
    }

    /// Load every `*.json` file in a directory
    ///
    /// Stops at the first invalid document; profiles loaded before it stay in
    /// the repository. Returns the number of profiles loaded.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize, ProfileError> {
        let dir = dir.as_ref();
        let read_err = |source| ProfileError::Read {
            path: dir.display().to_string(),
            source,
        };

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        // Deterministic order so a duplicate model resolves the same way every time
        paths.sort();

        for path in &paths {
            self.load_file(path)?;
        }
        Ok(paths.len())
    }

    /// Look up a profile by model identifier
    pub fn get(&self, model: &str) -> Option<Arc<DeviceProfile>> {
        self.profiles.get(model).cloned()
    }

    /// Model identifiers, sorted
    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.profiles.keys().cloned().collect();
        models.sort();
        models
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_profiles_load() {
        let repo = ProfileRepository::with_builtin().unwrap();
        assert_eq!(repo.models(), builtin_models());
        let profile = repo.get("ecam-espresso").unwrap();
        assert!(profile.command("start_brew").is_some());
        assert_eq!(
            profile.resolve("temperature").map(|f| f.name.as_str()),
            Some("boiler_temperature")
        );
    }

    #[test]
    fn test_shared_instance() {
        let repo = ProfileRepository::with_builtin().unwrap();
        let a = repo.get("ecam-espresso").unwrap();
        let b = repo.get("ecam-espresso").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_unknown_builtin() {
        assert!(matches!(
            load(ProfileSource::Builtin("percolator")),
            Err(ProfileError::UnknownBuiltin(id)) if id == "percolator"
        ));
    }
}
