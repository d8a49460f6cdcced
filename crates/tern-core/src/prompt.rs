//! Prompt assembly for one step attempt.

use std::fmt::Write as _;

use tern_store::models::WorkflowRun;

use crate::steps::Step;

/// Step instructions followed by any answers and review notes collected
/// for this step.
pub fn build_prompt(step: &Step, run: &WorkflowRun) -> String {
    let mut prompt = match &step.prompt {
        Some(text) if !text.trim().is_empty() => text.trim_end().to_string(),
        _ => format!(
            "Carry out the \"{}\" step ({}) of the {} workflow for the project in {}. \
             Write your results as your final answer.",
            step.display_title(),
            step.id,
            run.mode,
            run.project_dir.display()
        ),
    };

    if let Some(answers) = run.answers_for(&step.id).filter(|a| !a.is_empty()) {
        prompt.push_str("\n\n## Answers to your previous questions\n\n");
        for (number, answer) in answers {
            let _ = writeln!(prompt, "{number}. {}", answer.trim());
        }
    }

    if let Some(notes) = run.review_notes.get(&step.id).filter(|n| !n.is_empty()) {
        prompt.push_str(
            "\n\n## Reviewer feedback\n\nYour previous output for this step was not approved. \
             Address the following and produce a revised result:\n\n",
        );
        for note in notes {
            let _ = writeln!(prompt, "- {}", note.trim());
        }
    }

    prompt
}
