//! Registry of challenge managers, keyed by challenge id and by event.

use std::collections::HashMap;

use chainview_core::challenge::ChallengeEvent;
use chainview_core::error::IndexerError;

use crate::definitions::ChallengeDefinition;
use crate::manager::ChallengeManager;

/// Maps challenge ids to managers and events to ordered listener lists.
#[derive(Debug, Default, Clone)]
pub struct ChallengeRegistry {
    managers: HashMap<String, ChallengeManager>,
    listeners: HashMap<ChallengeEvent, Vec<String>>,
}

impl ChallengeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `manager` as a listener of `event`.
    ///
    /// Listeners of an event run in registration order, so a prerequisite
    /// challenge must be registered before the challenges that depend on it.
    pub fn register(&mut self, event: ChallengeEvent, manager: ChallengeManager) {
        let id = manager.challenge_id().to_string();
        let listeners = self.listeners.entry(event).or_default();
        if !listeners.contains(&id) {
            listeners.push(id.clone());
        }
        self.managers.insert(id, manager);
    }

    pub fn get(&self, challenge_id: &str) -> Option<&ChallengeManager> {
        self.managers.get(challenge_id)
    }

    /// Challenge ids listening to `event`, in processing order.
    pub fn listeners(&self, event: ChallengeEvent) -> &[String] {
        self.listeners.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn challenge_ids(&self) -> impl Iterator<Item = &str> {
        self.managers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Build a registry from definitions, ordering every prerequisite before
    /// its dependents.
    pub fn from_definitions(definitions: &[ChallengeDefinition]) -> Result<Self, IndexerError> {
        let mut registry = Self::new();
        for def in order_by_prerequisite(definitions)? {
            let manager = ChallengeManager::new(def.id.clone(), def.build_updater());
            for event in def.events() {
                registry.register(event, manager.clone());
            }
        }
        Ok(registry)
    }
}

fn order_by_prerequisite(definitions: &[ChallengeDefinition]) -> Result<Vec<&ChallengeDefinition>, IndexerError> {
    let by_id: HashMap<&str, &ChallengeDefinition> =
        definitions.iter().map(|d| (d.id.as_str(), d)).collect();
    if by_id.len() != definitions.len() {
        return Err(IndexerError::Config("duplicate challenge id in definitions".into()));
    }

    let mut ordered: Vec<&ChallengeDefinition> = Vec::with_capacity(definitions.len());
    for def in definitions {
        let mut chain = vec![def];
        let mut cursor = def;
        while let Some(prereq) = cursor.prerequisite.as_deref() {
            let parent = by_id.get(prereq).copied().ok_or_else(|| {
                IndexerError::Config(format!("challenge '{}' requires unknown '{prereq}'", cursor.id))
            })?;
            if chain.iter().any(|d| d.id == parent.id) {
                return Err(IndexerError::Config(format!(
                    "prerequisite cycle through challenge '{}'",
                    parent.id
                )));
            }
            chain.push(parent);
            cursor = parent;
        }
        for d in chain.into_iter().rev() {
            if !ordered.iter().any(|o| o.id == d.id) {
                ordered.push(d);
            }
        }
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainview_core::challenge::ChallengeType;

    fn def(id: &str, prerequisite: Option<&str>) -> ChallengeDefinition {
        ChallengeDefinition {
            id: id.into(),
            challenge_type: ChallengeType::Numeric,
            amount: 1,
            active: true,
            step_count: Some(1),
            starting_block: None,
            event: ChallengeEvent::TrackListen,
            also_on: vec![],
            updater: None,
            prerequisite: prerequisite.map(Into::into),
            specifier_field: None,
        }
    }

    #[test]
    fn prerequisites_listen_first() {
        let defs = vec![def("p3", Some("p2")), def("p1", None), def("p2", Some("p1"))];
        let registry = ChallengeRegistry::from_definitions(&defs).unwrap();
        assert_eq!(registry.listeners(ChallengeEvent::TrackListen), ["p1", "p2", "p3"]);
        assert_eq!(registry.get("p2").unwrap().updater().kind(), "milestone");
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn secondary_events_share_one_manager() {
        let mut profile = def("profile", None);
        profile.event = ChallengeEvent::ProfileUpdate;
        profile.also_on = vec![ChallengeEvent::Follow, ChallengeEvent::ProfileUpdate];
        let registry = ChallengeRegistry::from_definitions(&[profile]).unwrap();
        assert_eq!(registry.listeners(ChallengeEvent::ProfileUpdate), ["profile"]);
        assert_eq!(registry.listeners(ChallengeEvent::Follow), ["profile"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_prerequisite_rejected() {
        let err = ChallengeRegistry::from_definitions(&[def("p2", Some("missing"))]).unwrap_err();
        assert!(matches!(err, IndexerError::Config(_)));
    }

    #[test]
    fn cycle_rejected() {
        let defs = vec![def("a", Some("b")), def("b", Some("a"))];
        assert!(ChallengeRegistry::from_definitions(&defs).is_err());
    }

    #[test]
    fn unregistered_event_has_no_listeners() {
        let registry = ChallengeRegistry::new();
        assert!(registry.listeners(ChallengeEvent::SendTip).is_empty());
        assert!(registry.is_empty());
    }
}
