//! 失败记忆：最近几次 replan / fail 的原因
//!
//! 在单个会话内有效（挂起恢复时随会话记录带回），拼入下一次感知的记忆摘录，减少重复犯错。
//! 只保留最近 capacity 条。

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::tools::preview;

/// summary 最大字符数
pub const FAILURE_SUMMARY_CHARS: usize = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureNote {
    /// 哪一步、什么结果
    pub description: String,
    /// 当时感知到的结果要求
    pub requirement: String,
    /// 执行输出或错误（截断）
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureMemory {
    capacity: usize,
    notes: VecDeque<FailureNote>,
}

impl FailureMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            notes: VecDeque::new(),
        }
    }

    /// 从会话记录恢复
    pub fn restore(capacity: usize, notes: Vec<FailureNote>) -> Self {
        let mut memory = Self::new(capacity);
        for note in notes {
            memory.push(note);
        }
        memory
    }

    pub fn record(&mut self, description: impl Into<String>, requirement: impl Into<String>, summary: &str) {
        self.push(FailureNote {
            description: description.into(),
            requirement: requirement.into(),
            summary: preview(summary, FAILURE_SUMMARY_CHARS),
        });
    }

    fn push(&mut self, note: FailureNote) {
        self.notes.push_back(note);
        while self.notes.len() > self.capacity {
            self.notes.pop_front();
        }
    }

    pub fn notes(&self) -> Vec<FailureNote> {
        self.notes.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    /// 拼入记忆摘录的段落
    pub fn to_prompt_section(&self) -> String {
        if self.notes.is_empty() {
            return String::new();
        }
        let mut s = String::from("## Failed attempts\n");
        for note in &self.notes {
            s.push_str(&format!(
                "- {} (requirement: {}): {}\n",
                note.description, note.requirement, note.summary
            ));
        }
        s
    }
}
