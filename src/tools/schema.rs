//! 代码单元 JSON Schema 生成（schemars）
//!
//! 拼入决策阶段的 system prompt，减少模型输出格式错误。

use schemars::schema_for;

use crate::tools::CodeUnit;

/// 返回代码单元的 JSON Schema 字符串
pub fn code_unit_schema_json() -> String {
    let schema = schema_for!(CodeUnit);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
