//! Content models shared by the DTD and schema validators.
use crate::document::{Document, Node};
use crate::element::Element;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Term {
    /// Matches one child element with this local name.
    Element(String),
    /// Matches one child element with any name.
    Any,
    Sequence(Vec<Particle>),
    Choice(Vec<Particle>),
    /// Members match in any order. Members must be `Element` terms.
    All(Vec<Particle>),
}

/// A term with occurrence bounds. `max: None` is unbounded.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Particle {
    pub term: Term,
    pub min: u32,
    pub max: Option<u32>,
}

impl Particle {
    pub fn new(term: Term, min: u32, max: Option<u32>) -> Particle {
        Particle { term, min, max }
    }

    pub fn once(term: Term) -> Particle {
        Particle::new(term, 1, Some(1))
    }

    /// Whether the whole name sequence matches this particle.
    pub fn matches(&self, names: &[&str]) -> bool {
        self.ends(names, 0).contains(&names.len())
    }

    /// All positions where a match of this particle starting at `start` can end.
    fn ends(&self, names: &[&str], start: usize) -> BTreeSet<usize> {
        let mut result = BTreeSet::new();
        if self.min == 0 {
            result.insert(start);
        }
        let mut frontier: BTreeSet<usize> = [start].into_iter().collect();
        let mut count = 0;
        while !frontier.is_empty() && self.max.map_or(true, |max| count < max) {
            let mut next = BTreeSet::new();
            for pos in &frontier {
                next.extend(self.term.ends(names, *pos));
            }
            count += 1;
            if count < self.min {
                frontier = next;
                continue;
            }
            // unbounded repetition stops once no new end position shows up
            frontier = next.difference(&result).copied().collect();
            result.extend(next);
        }
        result
    }
}

impl Term {
    fn ends(&self, names: &[&str], start: usize) -> BTreeSet<usize> {
        match self {
            Term::Element(name) => match names.get(start) {
                Some(found) if *found == name.as_str() => [start + 1].into_iter().collect(),
                _ => BTreeSet::new(),
            },
            Term::Any => match names.get(start) {
                Some(_) => [start + 1].into_iter().collect(),
                None => BTreeSet::new(),
            },
            Term::Sequence(particles) => {
                let mut positions: BTreeSet<usize> = [start].into_iter().collect();
                for particle in particles {
                    let mut next = BTreeSet::new();
                    for pos in positions {
                        next.extend(particle.ends(names, pos));
                    }
                    positions = next;
                }
                positions
            }
            Term::Choice(particles) => particles
                .iter()
                .flat_map(|particle| particle.ends(names, start))
                .collect(),
            Term::All(particles) => {
                let mut counts = vec![0u32; particles.len()];
                let mut pos = start;
                while let Some(name) = names.get(pos) {
                    let member = particles.iter().enumerate().position(|(i, p)| {
                        p.term == Term::Element(name.to_string())
                            && p.max.map_or(true, |max| counts[i] < max)
                    });
                    match member {
                        Some(i) => counts[i] += 1,
                        None => break,
                    }
                    pos += 1;
                }
                let satisfied = particles
                    .iter()
                    .zip(&counts)
                    .all(|(p, count)| *count >= p.min);
                match satisfied {
                    true => [pos].into_iter().collect(),
                    false => BTreeSet::new(),
                }
            }
        }
    }
}

/// Names of the child elements, and whether there is non-empty character data.
/// Names are local unless `qualified` is set.
pub(crate) fn child_names_and_text<'a>(
    document: &'a Document,
    element: Element,
    qualified: bool,
) -> (Vec<&'a str>, bool) {
    let mut names = Vec::new();
    let mut has_text = false;
    for node in element.children(document) {
        match node {
            Node::Element(child) if qualified => names.push(child.full_name(document)),
            Node::Element(child) => names.push(child.name(document)),
            Node::Text(text) | Node::CData(text) => has_text |= !text.trim().is_empty(),
            _ => {}
        }
    }
    (names, has_text)
}

/// Renders a particle roughly the way a DTD would write it, for error messages.
pub(crate) fn describe(particle: &Particle) -> String {
    let term = match &particle.term {
        Term::Element(name) => name.clone(),
        Term::Any => "*any*".to_string(),
        Term::Sequence(ps) => format!("({})", join(ps, ", ")),
        Term::Choice(ps) => format!("({})", join(ps, " | ")),
        Term::All(ps) => format!("all({})", join(ps, ", ")),
    };
    let suffix = match (particle.min, particle.max) {
        (1, Some(1)) => String::new(),
        (0, Some(1)) => "?".to_string(),
        (0, None) => "*".to_string(),
        (1, None) => "+".to_string(),
        (min, Some(max)) => format!("{{{},{}}}", min, max),
        (min, None) => format!("{{{},}}", min),
    };
    format!("{}{}", term, suffix)
}

fn join(particles: &[Particle], sep: &str) -> String {
    particles.iter().map(describe).collect::<Vec<_>>().join(sep)
}
