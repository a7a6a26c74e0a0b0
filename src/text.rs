//! Text encoding of vocabularies and databases.
//!
//! A vocabulary is written the way DBoW2 writes its text vocabularies:
//!
//! ```text
//! k L scoring weighting
//! parent is_leaf <descriptor> weight      (one line per node, root excluded)
//! ```
//!
//! Node ids are implied by line order (the first node line is node 1) and
//! words are numbered by walking the leaves in node id order. Internal
//! centroids are kept so that quantization descends the tree exactly as built.
//!
//! A database is its vocabulary followed by
//!
//! ```text
//! DATABASE entries direct_index levels
//! n word weight word weight ...           (one line per entry)
//! m node c i_1 .. i_c node c ...          (per entry, only with a direct index)
//! ```
//!
//! Numbers are written in their shortest round-trip form, so loading a saved
//! file gives back an identical vocabulary or database.

use log::info;
use std::{
    fs::File,
    io::{BufWriter, Read, Write},
    path::Path,
    str::FromStr,
};

use crate::{
    vocab::{validate_shape, Node},
    *,
};

const DATABASE_TAG: &str = "DATABASE";

impl<D: Descriptor> Vocabulary<D> {
    pub fn write_text<W: Write>(&self, w: &mut W) -> BowResult<()> {
        writeln!(
            w,
            "{} {} {} {}",
            self.k(),
            self.l(),
            self.scoring().code(),
            self.weighting().code()
        )?;
        for node in self.nodes().iter().skip(1) {
            let (parent, descriptor) = match (node.parent, &node.descriptor) {
                (Some(p), Some(d)) => (p, d),
                _ => continue,
            };
            writeln!(
                w,
                "{} {} {} {}",
                parent,
                node.children.is_empty() as u8,
                descriptor.to_text(),
                node.weight
            )?;
        }
        Ok(())
    }

    pub fn read_text<R: Read>(mut r: R) -> BowResult<Self> {
        let mut s = String::new();
        r.read_to_string(&mut s)?;
        let mut lines = Lines::new(&s);
        let v = parse_vocabulary(&mut lines)?;
        lines.expect_end()?;
        Ok(v)
    }

    /// Save the vocabulary as text.
    pub fn save_text<P: AsRef<Path>>(&self, path: P) -> BowResult<()> {
        let mut w = BufWriter::new(File::create(path.as_ref())?);
        self.write_text(&mut w)?;
        w.flush()?;
        info!(
            "Saved {} word vocabulary to {:?}",
            self.num_words(),
            path.as_ref()
        );
        Ok(())
    }

    /// Load a vocabulary saved with [`Vocabulary::save_text`] (or by DBoW2).
    pub fn load_text<P: AsRef<Path>>(path: P) -> BowResult<Self> {
        let v = Self::read_text(File::open(path.as_ref())?)?;
        info!(
            "Loaded {} word vocabulary from {:?}",
            v.num_words(),
            path.as_ref()
        );
        Ok(v)
    }
}

impl<D: Descriptor> Database<D> {
    pub fn write_text<W: Write>(&self, w: &mut W) -> BowResult<()> {
        self.vocabulary().write_text(w)?;
        let params = self.params();
        writeln!(
            w,
            "{} {} {} {}",
            DATABASE_TAG,
            self.size(),
            params.direct_index as u8,
            params.direct_index_levels
        )?;
        for (id, bow) in self.entries().iter().enumerate() {
            write!(w, "{}", bow.len())?;
            for (word, weight) in bow.iter() {
                write!(w, " {} {}", word, weight)?;
            }
            writeln!(w)?;

            if let Some(fv) = self.feature_vector(id) {
                write!(w, "{}", fv.len())?;
                for (node, features) in fv.iter() {
                    write!(w, " {} {}", node, features.len())?;
                    for i in features {
                        write!(w, " {}", i)?;
                    }
                }
                writeln!(w)?;
            }
        }
        Ok(())
    }

    pub fn read_text<R: Read>(mut r: R) -> BowResult<Self> {
        let mut s = String::new();
        r.read_to_string(&mut s)?;
        let mut lines = Lines::new(&s);
        let vocab: Vocabulary<D> = parse_vocabulary(&mut lines)?;

        let (n, line) = lines
            .next()
            .ok_or_else(|| BowErr::corrupt(lines.line(), "missing database header"))?;
        let mut tokens = Tokens::new(line, n);
        if tokens.next_str()? != DATABASE_TAG {
            return Err(BowErr::corrupt(n, "expected database header"));
        }
        let n_entries: usize = tokens.parse()?;
        let params = DatabaseParams {
            direct_index: tokens.parse::<u8>()? != 0,
            direct_index_levels: tokens.parse()?,
        };
        tokens.expect_end()?;

        let mut entries = Vec::with_capacity(n_entries);
        let mut direct_index = Vec::new();
        for _ in 0..n_entries {
            let (n, line) = lines
                .next()
                .ok_or_else(|| BowErr::corrupt(lines.line(), "truncated database"))?;
            let bow = parse_bow(line, n)?;
            if let Some(w) = bow.words().find(|&w| w >= vocab.num_words()) {
                return Err(BowErr::corrupt(n, format!("unknown word {}", w)));
            }
            entries.push(bow);

            if params.direct_index {
                let (n, line) = lines
                    .next()
                    .ok_or_else(|| BowErr::corrupt(lines.line(), "truncated direct index"))?;
                direct_index.push(parse_feature_vector(line, n)?);
            }
        }
        lines.expect_end()?;

        Self::from_parts(vocab, params, entries, direct_index)
    }

    /// Save the database, vocabulary included, as text.
    pub fn save_text<P: AsRef<Path>>(&self, path: P) -> BowResult<()> {
        let mut w = BufWriter::new(File::create(path.as_ref())?);
        self.write_text(&mut w)?;
        w.flush()?;
        info!(
            "Saved database with {} entries to {:?}",
            self.size(),
            path.as_ref()
        );
        Ok(())
    }

    pub fn load_text<P: AsRef<Path>>(path: P) -> BowResult<Self> {
        let db = Self::read_text(File::open(path.as_ref())?)?;
        info!(
            "Loaded database with {} entries from {:?}",
            db.size(),
            path.as_ref()
        );
        Ok(db)
    }
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

/// Non-blank lines with their 1-based line numbers.
struct Lines<'a> {
    lines: Vec<(usize, &'a str)>,
    pos: usize,
}

impl<'a> Lines<'a> {
    fn new(s: &'a str) -> Self {
        Self {
            lines: s
                .lines()
                .enumerate()
                .map(|(i, l)| (i + 1, l.trim()))
                .filter(|(_, l)| !l.is_empty())
                .collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<(usize, &'a str)> {
        self.lines.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<(usize, &'a str)> {
        let l = self.peek()?;
        self.pos += 1;
        Some(l)
    }

    /// Line number to report when input ends early.
    fn line(&self) -> usize {
        self.lines.last().map(|(n, _)| n + 1).unwrap_or(1)
    }

    fn expect_end(&self) -> BowResult<()> {
        match self.peek() {
            Some((n, _)) => Err(BowErr::corrupt(n, "unexpected trailing data")),
            None => Ok(()),
        }
    }
}

struct Tokens<'a> {
    iter: std::str::SplitWhitespace<'a>,
    line: usize,
}

impl<'a> Tokens<'a> {
    fn new(s: &'a str, line: usize) -> Self {
        Self {
            iter: s.split_whitespace(),
            line,
        }
    }

    fn next_str(&mut self) -> BowResult<&'a str> {
        self.iter
            .next()
            .ok_or_else(|| BowErr::corrupt(self.line, "line is too short"))
    }

    fn parse<T: FromStr>(&mut self) -> BowResult<T> {
        let t = self.next_str()?;
        t.parse()
            .map_err(|_| BowErr::corrupt(self.line, format!("cannot parse {:?}", t)))
    }

    fn expect_end(&mut self) -> BowResult<()> {
        match self.iter.next() {
            Some(t) => Err(BowErr::corrupt(self.line, format!("unexpected {:?}", t))),
            None => Ok(()),
        }
    }
}

fn parse_weight(t: &str, line: usize) -> BowResult<f64> {
    match t.parse::<f64>() {
        Ok(w) if w.is_finite() && w >= 0. => Ok(w),
        _ => Err(BowErr::corrupt(line, format!("bad weight {:?}", t))),
    }
}

fn parse_vocabulary<D: Descriptor>(lines: &mut Lines) -> BowResult<Vocabulary<D>> {
    let (n, header) = lines
        .next()
        .ok_or_else(|| BowErr::corrupt(1, "missing vocabulary header"))?;
    let mut tokens = Tokens::new(header, n);
    let k: usize = tokens.parse()?;
    let l: usize = tokens.parse()?;
    let scoring = ScoringType::from_code(tokens.parse()?).map_err(|e| e.at_line(n))?;
    let weighting = WeightingType::from_code(tokens.parse()?).map_err(|e| e.at_line(n))?;
    tokens.expect_end()?;
    validate_shape(k, l).map_err(|e| BowErr::corrupt(n, e.to_string()))?;

    let mut nodes: Vec<Node<D>> = vec![Node {
        parent: None,
        children: Vec::new(),
        descriptor: None,
        weight: 0.,
        word_id: None,
    }];
    let mut leaf_flags = vec![false];
    let mut node_lines = vec![0usize];
    let mut levels = vec![0usize];
    let mut dimension = None;

    while let Some((n, line)) = lines.peek() {
        if line.starts_with(DATABASE_TAG) {
            break;
        }
        lines.next();

        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 4 {
            return Err(BowErr::corrupt(n, "node line is too short"));
        }
        let id = nodes.len();
        let parent: NodeId = tokens[0]
            .parse()
            .map_err(|_| BowErr::corrupt(n, format!("bad parent {:?}", tokens[0])))?;
        if parent >= id {
            return Err(BowErr::corrupt(n, format!("node {} has parent {}", id, parent)));
        }
        if leaf_flags[parent] {
            return Err(BowErr::corrupt(n, format!("parent {} is a leaf", parent)));
        }
        let is_leaf = match tokens[1] {
            "0" => false,
            "1" => true,
            t => return Err(BowErr::corrupt(n, format!("bad leaf flag {:?}", t))),
        };
        let level = levels[parent] + 1;
        if level > l {
            return Err(BowErr::corrupt(n, format!("node {} is deeper than {}", id, l)));
        }
        if nodes[parent].children.len() >= k {
            return Err(BowErr::corrupt(n, format!("node {} has too many children", parent)));
        }
        let descriptor = D::from_text(&tokens[2..tokens.len() - 1].join(" "))
            .map_err(|e| e.at_line(n))?;
        let found = descriptor.dimension();
        if *dimension.get_or_insert(found) != found {
            return Err(BowErr::corrupt(n, "descriptor dimension changes"));
        }
        let weight = parse_weight(tokens[tokens.len() - 1], n)?;

        nodes[parent].children.push(id);
        nodes.push(Node {
            parent: Some(parent),
            children: Vec::new(),
            descriptor: Some(descriptor),
            weight,
            word_id: None,
        });
        leaf_flags.push(is_leaf);
        node_lines.push(n);
        levels.push(level);
    }

    if nodes.len() == 1 {
        return Err(BowErr::corrupt(lines.line(), "vocabulary has no nodes"));
    }
    if let Some(id) = (1..nodes.len()).find(|&i| !leaf_flags[i] && nodes[i].children.is_empty()) {
        return Err(BowErr::corrupt(
            node_lines[id],
            format!("inner node {} has no children", id),
        ));
    }

    Vocabulary::from_nodes(
        k,
        l,
        BowKind {
            weighting,
            scoring,
        },
        nodes,
    )
}

fn parse_bow(line: &str, n: usize) -> BowResult<BowVector> {
    let mut tokens = Tokens::new(line, n);
    let len: usize = tokens.parse()?;
    let mut bow = BowVector::new();
    for _ in 0..len {
        let word: WordId = tokens.parse()?;
        let weight = parse_weight(tokens.next_str()?, n)?;
        if bow.contains(word) {
            return Err(BowErr::corrupt(n, format!("word {} repeated", word)));
        }
        bow.add_weight(word, weight);
    }
    tokens.expect_end()?;
    Ok(bow)
}

fn parse_feature_vector(line: &str, n: usize) -> BowResult<FeatureVector> {
    let mut tokens = Tokens::new(line, n);
    let len: usize = tokens.parse()?;
    let mut fv = FeatureVector::new();
    for _ in 0..len {
        let node: NodeId = tokens.parse()?;
        if fv.get(node).is_some() {
            return Err(BowErr::corrupt(n, format!("node {} repeated", node)));
        }
        let count: usize = tokens.parse()?;
        for _ in 0..count {
            fv.add_feature(node, tokens.parse()?);
        }
    }
    tokens.expect_end()?;
    Ok(fv)
}
