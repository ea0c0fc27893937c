/*
 * Copyright 2026 The quern project developers
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt;

/// One element of a hierarchical task name: either a plain label or the
/// values of a cross axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Label(String),
    Cross(Vec<String>),
}

/// The hierarchical name of a named task.
///
/// Renders to both a display string (`app.cross[2.13,jvm].compile`) and a
/// filesystem path (cross values become sibling path components).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Segments(Vec<Segment>);

impl Segments {
    pub fn new() -> Segments {
        Segments(Vec::new())
    }

    pub fn labels<I, S>(parts: I) -> Segments
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Segments(parts.into_iter().map(|s| Segment::Label(s.into())).collect())
    }

    /// Splits a dotted declaration path (`build.app.Module`) into labels.
    pub fn from_dotted(path: &str) -> Segments {
        Segments::labels(path.split('.').filter(|s| !s.is_empty()))
    }

    pub fn push(&mut self, segment: Segment) {
        self.0.push(segment);
    }

    pub fn concat(&self, other: &Segments) -> Segments {
        let mut joined = self.0.clone();
        joined.extend(other.0.iter().cloned());
        Segments(joined)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// Path components: labels stay whole, cross values flatten as siblings.
    pub fn parts(&self) -> Vec<&str> {
        let mut parts = Vec::new();
        for segment in &self.0 {
            match segment {
                Segment::Label(s) => parts.push(s.as_str()),
                Segment::Cross(values) => parts.extend(values.iter().map(|v| v.as_str())),
            }
        }
        parts
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                Segment::Label(s) => {
                    if i > 0 {
                        out.push('.');
                    }
                    out.push_str(s);
                }
                Segment::Cross(values) => {
                    out.push('[');
                    out.push_str(&values.join(","));
                    out.push(']');
                }
            }
        }
        out
    }
}

impl fmt::Display for Segments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
