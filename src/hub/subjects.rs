use std::collections::HashMap;

use crate::bus::queue_name;
use crate::checker::Checkers;
use crate::config::{ExerciseConfig, SubjectConfig};

/// Routing for one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub queue: String,
    pub extension: String,
}

impl Subject {
    /// Submissions always run `main.<ext>` from the source root.
    pub fn entry_point(&self) -> String {
        format!("main.{}", self.extension)
    }
}

/// What a submission against one exercise runs on and is judged by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exercise {
    pub subject: Subject,
    pub checkers: Checkers,
}

#[derive(Debug, Clone, Default)]
pub struct SubjectCatalog {
    subjects: HashMap<String, Subject>,
    exercises: HashMap<String, Exercise>,
}

impl SubjectCatalog {
    /// Exercises naming a subject that is not configured are left out.
    pub fn new(
        queue_prefix: &str,
        subjects: &HashMap<String, SubjectConfig>,
        exercises: &HashMap<String, ExerciseConfig>,
    ) -> Self {
        let subjects: HashMap<String, Subject> = subjects
            .iter()
            .map(|(name, config)| {
                let subject = Subject {
                    queue: config
                        .queue
                        .clone()
                        .unwrap_or_else(|| queue_name(queue_prefix, name)),
                    extension: config.extension.trim_start_matches('.').to_string(),
                };
                (name.clone(), subject)
            })
            .collect();

        let exercises = exercises
            .iter()
            .filter_map(|(id, config)| {
                let subject = subjects.get(&config.subject)?.clone();
                let checkers = Checkers {
                    io: config.io_checker.clone(),
                    code: config.code_checker.clone(),
                };
                Some((id.clone(), Exercise { subject, checkers }))
            })
            .collect();

        Self {
            subjects,
            exercises,
        }
    }

    pub fn subject(&self, name: &str) -> Option<&Subject> {
        self.subjects.get(name)
    }

    pub fn exercise(&self, id: &str) -> Option<&Exercise> {
        self.exercises.get(id)
    }
}
