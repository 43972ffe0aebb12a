//! topic 与 topic filter 的校验和匹配

fn has_wildcards(s: &str) -> bool {
    s.contains(|c: char| c == '+' || c == '#')
}

/// 发布使用的 topic 不能为空，不能含有通配符
pub fn valid_publish_topic(topic: &str) -> bool {
    !topic.is_empty() && !has_wildcards(topic)
}

pub fn valid_subscribe_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let last = levels.peek().is_none();
        match level {
            // # 只能是最后一层
            "#" if !last => return false,
            "#" | "+" => {}
            // 通配符必须独占一层
            _ if has_wildcards(level) => return false,
            _ => {}
        }
    }

    true
}

/// 发布的 topic 是否匹配订阅的 filter
pub fn matches(topic: &str, filter: &str) -> bool {
    // $ 开头的 topic 不匹配以通配符开头的 filter
    if topic.starts_with('$') && filter.starts_with(|c: char| c == '+' || c == '#') {
        return false;
    }

    let mut topics = topic.split('/');
    for f in filter.split('/') {
        match (f, topics.next()) {
            // # 匹配父级和所有子级
            ("#", _) => return true,
            (_, None) => return false,
            ("+", Some(_)) => {}
            (f, Some(t)) if f != t => return false,
            _ => {}
        }
    }

    // filter 层级不够
    topics.next().is_none()
}
