//! 스트림 처리기 출력
//!
//! `feed`/`process` 한 번의 호출이 내놓는 결과: 없음, 하나, 또는 여러 개.

/// 처리 결과
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Output<T> {
    #[default]
    Empty,
    One(T),
    Many(Vec<T>),
}

impl<T> Output<T> {
    /// 항목 추가
    pub fn push(&mut self, item: T) {
        *self = match std::mem::take(self) {
            Output::Empty => Output::One(item),
            Output::One(first) => Output::Many(vec![first, item]),
            Output::Many(mut items) => {
                items.push(item);
                Output::Many(items)
            }
        };
    }

    pub fn len(&self) -> usize {
        match self {
            Output::Empty => 0,
            Output::One(_) => 1,
            Output::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            Output::Empty => Vec::new(),
            Output::One(item) => vec![item],
            Output::Many(items) => items,
        }
    }
}

impl<T> From<Vec<T>> for Output<T> {
    fn from(mut items: Vec<T>) -> Self {
        match items.len() {
            0 => Output::Empty,
            1 => items.pop().map_or(Output::Empty, Output::One),
            _ => Output::Many(items),
        }
    }
}

impl<T> IntoIterator for Output<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.into_vec().into_iter()
    }
}
