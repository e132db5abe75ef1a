//! 请求文本规范化：小写、压缩空白、去常见标点（含中日韩全角符号）
//!
//! 只做无损归一，绝不改写实质措辞；规范化结果作为线程历史与精确缓存的键。

/// 会被剥除的标点集合（半角 + 常见全角/CJK）
const PUNCTUATION: &[char] = &[
    ',', '.', '!', '?', ';', ':', '\'', '"', '(', ')', '[', ']', '{', '}',
    '，', '。', '！', '？', '；', '：', '、', '“', '”', '‘', '’', '（', '）',
    '【', '】', '《', '》', '…', '—',
];

/// 规范化：lowercase -> 去标点 -> 压缩空白
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped: String = lowered
        .chars()
        .map(|c| if PUNCTUATION.contains(&c) { ' ' } else { c })
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}
