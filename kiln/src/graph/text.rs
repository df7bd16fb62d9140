//! Text import and GraphViz export
use super::{
    BinaryOpcode, Conv2dParams, DataType, Graph, NodeAttributes, OutputPort,
    QuantParam, TensorType, UnaryOpcode, shape,
};
use crate::Error;

use std::collections::HashMap;
use std::fmt::Write;
use std::io::{BufRead, BufReader, Read};

impl Graph {
    /// Parses a flat text representation of a network.  For example, a
    /// transposed convolution followed by a ReLU can be written as
    /// ```
    /// # use kiln::graph::Graph;
    /// let txt = "
    /// ## This is a comment!
    /// x input f32 1,3,8,8
    /// w const f32 4,3,1,1 0.5
    /// b const f32 4
    /// c conv2d x w b 1,1 0,0 +quantize
    /// r relu c
    /// t transpose r 0,2,3,1
    /// y output t
    /// ";
    /// let g = Graph::from_text(txt.as_bytes()).unwrap();
    /// assert_eq!(g.len(), 7);
    /// assert_eq!(g.outputs().len(), 1);
    /// ```
    ///
    /// Each line is `<name> <opcode> <args...>`; arguments are names of
    /// earlier lines, comma-separated integer lists, or numbers.  Flags such
    /// as `+quantize` and `+skip_fusion` may trail any line.
    ///
    /// This representation is loosely defined and only intended for use in
    /// quick experiments.
    pub fn from_text<R: Read>(r: R) -> Result<Self, Error> {
        let reader = BufReader::new(r);
        let mut g = Self::new();
        let mut seen: HashMap<String, OutputPort> = HashMap::new();

        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = i + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let err = |msg: &str| Error::ParseError(line_no, msg.to_owned());

            let (flags, words): (Vec<&str>, Vec<&str>) =
                line.split_whitespace().partition(|w| w.starts_with('+'));
            let mut iter = words.into_iter();
            let name = iter.next().ok_or_else(|| err("missing name"))?;
            let opcode = iter.next().ok_or_else(|| err("missing opcode"))?;

            let mut word = || iter.next().ok_or_else(|| err("missing argument"));
            let value = |w: &str| {
                seen.get(w)
                    .copied()
                    .ok_or_else(|| Error::UnknownValue(w.to_owned()))
            };
            let dims = |w: &str| -> Result<Vec<usize>, Error> {
                if w == "scalar" {
                    return Ok(vec![]);
                }
                w.split(',')
                    .map(|d| d.parse().map_err(|_| err("bad integer list")))
                    .collect()
            };
            let float = |w: &str| -> Result<f32, Error> {
                w.parse().map_err(|_| err("bad number"))
            };
            let dtype = |w: &str| -> Result<DataType, Error> {
                w.parse().map_err(|_| err("bad data type"))
            };

            let out = match opcode {
                "input" => {
                    let dt = dtype(word()?)?;
                    let s = dims(word()?)?;
                    let s = shape(&s).ok_or(Error::BadRank(s.len()))?;
                    Some(g.input(name, TensorType::new(dt, s))?)
                }
                "output" => {
                    g.output(name, value(word()?)?)?;
                    None
                }
                "const" => {
                    let dt = dtype(word()?)?;
                    let s = dims(word()?)?;
                    let s = shape(&s).ok_or(Error::BadRank(s.len()))?;
                    let ty = TensorType::new(dt, s);
                    let fill = match iter.next() {
                        Some(w) => float(w)?,
                        None => 0.0,
                    };
                    let n = ty.elements();
                    let data = match dt {
                        DataType::F32 => std::iter::repeat_n(fill, n)
                            .flat_map(|v| v.to_le_bytes())
                            .collect(),
                        DataType::I32 => std::iter::repeat_n(fill as i32, n)
                            .flat_map(|v| v.to_le_bytes())
                            .collect(),
                        DataType::I8 => vec![(fill as i8) as u8; n],
                        DataType::U8 => vec![fill as u8; n],
                        // Only the all-zero pattern is exact without an f16 codec
                        DataType::F16 if fill == 0.0 => vec![0; ty.bytes()],
                        DataType::F16 => {
                            return Err(err("f16 constants must be zero"));
                        }
                    };
                    Some(g.constant(ty, data)?)
                }
                "transpose" => {
                    let v = value(word()?)?;
                    let perm = dims(word()?)?;
                    Some(g.transpose(v, &perm)?)
                }
                "reshape" => {
                    let v = value(word()?)?;
                    let s = dims(word()?)?;
                    Some(g.reshape(v, &s)?)
                }
                "clamp" => {
                    let v = value(word()?)?;
                    let lo = float(word()?)?;
                    let hi = float(word()?)?;
                    Some(g.clamp(v, lo, hi)?)
                }
                "conv2d" => {
                    let x = value(word()?)?;
                    let w = value(word()?)?;
                    let b = value(word()?)?;
                    let mut params = Conv2dParams::default();
                    if let Some(s) = iter.next() {
                        let s = dims(s)?;
                        params.stride = s
                            .try_into()
                            .map_err(|_| err("stride must have 2 values"))?;
                    }
                    if let Some(p) = iter.next() {
                        let p = dims(p)?;
                        params.padding = p
                            .try_into()
                            .map_err(|_| err("padding must have 2 values"))?;
                    }
                    Some(g.conv2d(x, w, b, params)?)
                }
                "matmul" => {
                    let a = value(word()?)?;
                    let b = value(word()?)?;
                    Some(g.matmul(a, b)?)
                }
                "quantize" => {
                    let v = value(word()?)?;
                    let scale = float(word()?)?;
                    let zp = float(word()?)? as i32;
                    let dt = dtype(word()?)?;
                    Some(g.quantize(v, QuantParam::new(scale, zp), dt)?)
                }
                "dequantize" => {
                    let v = value(word()?)?;
                    let scale = float(word()?)?;
                    let zp = float(word()?)? as i32;
                    Some(g.dequantize(v, QuantParam::new(scale, zp))?)
                }
                op => {
                    if let Ok(u) = op.parse::<UnaryOpcode>() {
                        Some(g.unary(u, value(word()?)?)?)
                    } else if let Ok(b) = op.parse::<BinaryOpcode>() {
                        let lhs = value(word()?)?;
                        let rhs = value(word()?)?;
                        Some(g.binary(b, lhs, rhs)?)
                    } else {
                        return Err(Error::UnknownOpcode(op.to_owned()));
                    }
                }
            };

            if let Some(out) = out {
                g.set_name(out.node, name)?;
                for f in flags {
                    let attr = match f {
                        "+quantize" => NodeAttributes::QUANTIZE,
                        "+skip_fusion" => NodeAttributes::SKIP_FUSION,
                        _ => return Err(err("unknown flag")),
                    };
                    g.attributes_mut(out.node)?.insert(attr);
                }
                seen.insert(name.to_owned(), out);
            }
        }
        if g.is_empty() {
            Err(Error::EmptyFile)
        } else if g.outputs().is_empty() {
            Err(Error::EmptyGraph)
        } else {
            Ok(g)
        }
    }

    /// Converts the entire graph into a GraphViz drawing
    pub fn dot(&self) -> String {
        let mut out = "digraph mygraph{\n".to_owned();
        for id in self.node_ids() {
            let node = &self.nodes[id];
            let Some(node) = node else { continue };
            let op = node.op();
            writeln!(
                out,
                r#"n{0} [label = "{1}\n{2}" color="{3}1" shape="{4}" fontcolor="{3}4"]"#,
                id.get(),
                node.name(),
                op.label(),
                op.dot_node_color(),
                op.dot_node_shape()
            )
            .unwrap();
            for (i, p) in node.inputs().iter().enumerate() {
                if let Some(p) = p {
                    writeln!(
                        out,
                        r#"n{} -> n{} [label = "{}"]"#,
                        p.node.get(),
                        id.get(),
                        i
                    )
                    .unwrap();
                }
            }
        }
        out += "}\n";
        out
    }
}

#[cfg(test)]
mod test {
    use crate::Error;
    use crate::graph::*;

    #[test]
    fn parse_errors() {
        assert!(matches!(
            Graph::from_text("# nothing here\n".as_bytes()),
            Err(Error::EmptyFile)
        ));
        assert!(matches!(
            Graph::from_text("x input f32 4\n".as_bytes()),
            Err(Error::EmptyGraph)
        ));
        assert!(matches!(
            Graph::from_text("x input f32 4\ny frobnicate x\n".as_bytes()),
            Err(Error::UnknownOpcode(..))
        ));
        assert!(matches!(
            Graph::from_text("x input f32 4\ny abs z\n".as_bytes()),
            Err(Error::UnknownValue(..))
        ));
        assert!(matches!(
            Graph::from_text("x input f32 4,a\n".as_bytes()),
            Err(Error::ParseError(1, ..))
        ));
    }

    #[test]
    fn parse_flags_and_names() {
        let txt = "
            x input f32 2,3
            t transpose x 1,0 +skip_fusion
            y output t
        ";
        let g = Graph::from_text(txt.as_bytes()).unwrap();
        let out = g.outputs()[0];
        let t = g.connected_producer(out.input(0)).unwrap();
        let node = g.node(t.node).unwrap();
        assert_eq!(node.name(), "t");
        assert!(node.attributes().contains(NodeAttributes::SKIP_FUSION));
        assert_eq!(g.output_type(t).unwrap().shape.as_slice(), &[3, 2]);

        let dot = g.dot();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("transpose [1, 0]"));
    }
    #[test]
    fn constants_are_encoded_per_element() {
        let txt = "
            a const i32 2 1
            b const i8 3 -2
            c const f32 1 0.5
            d const f16 2
            y output a
        ";
        let g = Graph::from_text(txt.as_bytes()).unwrap();
        let data = |id: usize| match g.get_op(g.node_ids().nth(id).unwrap()) {
            Some(Op::Constant(d)) => d.clone(),
            op => panic!("unexpected {op:?}"),
        };
        assert_eq!(data(0), [1, 0, 0, 0, 1, 0, 0, 0]);
        assert_eq!(data(1), [0xfe; 3]);
        assert_eq!(data(2), 0.5f32.to_le_bytes());
        assert_eq!(data(3), [0; 4]);

        assert!(matches!(
            Graph::from_text("a const f16 2 1.5
y output a
".as_bytes()),
            Err(Error::ParseError(1, ..))
        ));
    }
}
