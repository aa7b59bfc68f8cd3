//! Unit tests for module descriptors and the job lifecycle.

use server_launcher::models::module::{module_of, JobState, ModuleDescriptor, MODULES};

#[test]
fn descriptor_table_covers_every_module() {
    let names: Vec<_> = MODULES.iter().map(|d| d.name).collect();
    assert_eq!(names, ["backend", "main", "processor", "runner", "storage"]);
    assert_eq!(ModuleDescriptor::lookup("main").map(|d| d.env_group), Some("engine"));
    assert!(ModuleDescriptor::lookup("webhooks").is_none());
}

#[test]
fn only_processor_is_elastic() {
    for descriptor in MODULES {
        assert_eq!(descriptor.elastic, descriptor.name == "processor");
    }
}

#[test]
fn elastic_jobs_are_indexed() {
    let processor = ModuleDescriptor::lookup("processor").expect("processor");
    assert_eq!(processor.instance_count(4), 4);
    assert_eq!(processor.job_name(0), "processor_0");
    assert_eq!(module_of(&processor.job_name(3)), "processor");

    let backend = ModuleDescriptor::lookup("backend").expect("backend");
    assert_eq!(backend.instance_count(4), 1);
    assert_eq!(backend.job_name(0), "backend");
}

#[test]
fn live_states_are_starting_and_running() {
    assert!(JobState::Starting.is_live());
    assert!(JobState::Running.is_live());
    assert!(!JobState::Exited.is_live());
    assert!(!JobState::StoppingIntentionally.is_live());
}

#[test]
fn crash_and_restart_transitions_are_allowed() {
    assert!(JobState::Running.can_transition_to(JobState::Exited));
    assert!(JobState::Exited.can_transition_to(JobState::Starting));
    assert!(JobState::Exited.can_transition_to(JobState::StoppingIntentionally));
    assert!(!JobState::StoppingIntentionally.can_transition_to(JobState::Starting));
}
