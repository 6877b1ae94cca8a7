//! 记忆协调
//!
//! 把长期记忆检索结果、本会话的失败记忆与人工输入合成一段记忆摘录，供感知阶段使用。

use std::sync::Arc;

use crate::memory::{FailureMemory, MemoryStore};

#[derive(Clone)]
pub struct ContextManager {
    store: Arc<dyn MemoryStore>,
}

impl ContextManager {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    pub fn excerpt(&self, query: &str, failures: &FailureMemory, human_inputs: &[String]) -> String {
        let mut sections = Vec::new();
        let related = self.store.search(query);
        if !related.is_empty() {
            sections.push(format!("## Related sessions\n{related}\n"));
        }
        let failed = failures.to_prompt_section();
        if !failed.is_empty() {
            sections.push(failed);
        }
        if !human_inputs.is_empty() {
            let mut s = String::from("## Human input\n");
            for input in human_inputs {
                s.push_str(&format!("- {input}\n"));
            }
            sections.push(s);
        }
        sections.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Resolution, SessionRecord, SessionStatus};
    use crate::memory::{InMemoryStore, NoopMemory};

    #[test]
    fn test_empty_excerpt() {
        let manager = ContextManager::new(Arc::new(NoopMemory));
        assert_eq!(manager.excerpt("anything", &FailureMemory::new(3), &[]), "");
    }

    #[test]
    fn test_excerpt_merges_sections() {
        let store = Arc::new(InMemoryStore::new(3));
        let mut record = SessionRecord::empty("old", "capital of Spain");
        record.final_status = SessionStatus::Concluded;
        record.final_answer_or_escalation = Some(Resolution::Answer { text: "Madrid".into() });
        store.append(&record).unwrap();

        let mut failures = FailureMemory::new(3);
        failures.record("step 1 replan", "capital city", "recipes");

        let manager = ContextManager::new(store);
        let excerpt = manager.excerpt("capital of France", &failures, &["Use Wikipedia".to_string()]);
        assert!(excerpt.contains("## Related sessions"));
        assert!(excerpt.contains("Madrid"));
        assert!(excerpt.contains("## Failed attempts"));
        assert!(excerpt.contains("- Use Wikipedia"));
    }
}
