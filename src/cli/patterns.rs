use crate::shuffle::PatternTable;
use crate::shuffle::pattern::StepRole;

pub fn list_patterns() {
    let table = PatternTable::builtin();
    for (index, pattern) in table.patterns().iter().enumerate() {
        println!("{:>2}. {}", index + 1, pattern.name);
        for (slot, predicate) in &pattern.slots {
            println!("      {:<8} {}", slot.to_string(), predicate);
        }
        for step in &pattern.steps {
            let role = match step.role {
                StepRole::Setup => "setup",
                StepRole::Commit => "commit",
                StepRole::Cleanup => "cleanup",
            };
            println!("      {:<8} {}", role, step.template);
        }
    }
}
