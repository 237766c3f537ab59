//! Route finding for the vault orb puzzle
//!
//! The vault antechamber is a 4x4 grid of numbers and operators. The orb
//! starts on the south-west `22` and must reach the north-east `1` (the door)
//! weighing exactly the target. Stepping onto an operator remembers it,
//! stepping onto a number applies the remembered operator to the orb.

use log::debug;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

const SIZE: usize = 4;
const START: usize = 0;
const DOOR: usize = 15;
const START_WEIGHT: u32 = 22;

/// Weights must stay below this, and above zero
pub const WEIGHT_LIMIT: u32 = 32768;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Add,
    Subtract,
    Multiply,
}

impl Operator {
    fn apply(self, weight: u32, value: u32) -> Option<u32> {
        let result = match self {
            Operator::Add => weight + value,
            Operator::Subtract => weight.checked_sub(value)?,
            Operator::Multiply => weight * value,
        };
        (1..WEIGHT_LIMIT).contains(&result).then_some(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tile {
    Value(u32),
    Op(Operator),
}

/// Tiles indexed by `x * 4 + y`, with `y` growing northwards
pub const GRID: [Tile; 16] = {
    use Operator::*;
    use Tile::*;
    [
        Value(22),
        Op(Add),
        Value(4),
        Op(Multiply),
        Op(Subtract),
        Value(4),
        Op(Multiply),
        Value(8),
        Value(9),
        Op(Subtract),
        Value(11),
        Op(Subtract),
        Op(Multiply),
        Value(18),
        Op(Multiply),
        Value(1),
    ]
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    North,
    East,
    South,
    West,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::North,
        Direction::East,
        Direction::South,
        Direction::West,
    ];

    /// The cell reached by moving from `cell`, if it is on the grid
    fn step(self, cell: usize) -> Option<usize> {
        let (x, y) = (cell / SIZE, cell % SIZE);
        match self {
            Direction::North if y + 1 < SIZE => Some(cell + 1),
            Direction::East if x + 1 < SIZE => Some(cell + SIZE),
            Direction::South if y > 0 => Some(cell - 1),
            Direction::West if x > 0 => Some(cell - SIZE),
            _ => None,
        }
    }

    /// The command typed into the game to walk this way
    pub fn command(self) -> &'static str {
        match self {
            Direction::North => "north",
            Direction::East => "east",
            Direction::South => "south",
            Direction::West => "west",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "n" | "north" => Ok(Direction::North),
            "e" | "east" => Ok(Direction::East),
            "s" | "south" => Ok(Direction::South),
            "w" | "west" => Ok(Direction::West),
            other => Err(format!("Unknown direction: {other}")),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            Direction::North => 'N',
            Direction::East => 'E',
            Direction::South => 'S',
            Direction::West => 'W',
        };
        write!(f, "{letter}")
    }
}

/// Where a replayed route ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Walk {
    pub x: usize,
    pub y: usize,
    pub weight: u32,
}

impl Walk {
    pub fn at_door(&self) -> bool {
        self.x * SIZE + self.y == DOOR
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Orb {
    cell: usize,
    weight: u32,
    pending: Option<Operator>,
}

impl Orb {
    fn start() -> Self {
        Orb {
            cell: START,
            weight: START_WEIGHT,
            pending: None,
        }
    }

    fn moved(self, direction: Direction) -> Result<Orb, String> {
        let cell = direction
            .step(self.cell)
            .ok_or_else(|| format!("Moving {} leaves the grid", direction.command()))?;
        if cell == START {
            return Err("The orb cannot go back to the start".to_string());
        }
        match GRID[cell] {
            Tile::Op(op) => Ok(Orb {
                cell,
                pending: Some(op),
                ..self
            }),
            Tile::Value(value) => {
                let op = self
                    .pending
                    .ok_or_else(|| format!("No operator before value {value}"))?;
                let weight = op.apply(self.weight, value).ok_or_else(|| {
                    format!("The orb weight leaves 1..{WEIGHT_LIMIT} at cell {cell}")
                })?;
                Ok(Orb {
                    cell,
                    weight,
                    pending: None,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    pub steps: Vec<Direction>,
}

impl Route {
    pub fn new(steps: Vec<Direction>) -> Self {
        Route { steps }
    }

    /// Replay the route. Reaching the door ends the walk, so a route that
    /// keeps going after it is rejected.
    pub fn evaluate(&self) -> Result<Walk, String> {
        let mut orb = Orb::start();
        for (i, direction) in self.steps.iter().enumerate() {
            if orb.cell == DOOR {
                return Err(format!("Route continues past the door at step {i}"));
            }
            orb = orb.moved(*direction)?;
        }
        Ok(Walk {
            x: orb.cell / SIZE,
            y: orb.cell % SIZE,
            weight: orb.weight,
        })
    }

    /// True if the route ends on the door with the orb weighing `target`
    pub fn opens_door(&self, target: u32) -> bool {
        matches!(self.evaluate(), Ok(walk) if walk.at_door() && walk.weight == target)
    }

    /// The game commands that walk this route
    pub fn commands(&self) -> Vec<&'static str> {
        self.steps.iter().map(|d| d.command()).collect()
    }
}

impl FromStr for Route {
    type Err = String;

    /// Comma or whitespace separated directions, e.g. `N,E,E,N`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let steps = s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|part| !part.is_empty())
            .map(Direction::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Route { steps })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letters: Vec<String> = self.steps.iter().map(|d| d.to_string()).collect();
        write!(f, "{}", letters.join(","))
    }
}

/// Breadth-first search for the shortest route that opens the door
pub fn solve(target: u32, max_steps: usize) -> Option<Route> {
    // (orb, parent node, direction taken to get here)
    let mut nodes: Vec<(Orb, usize, Option<Direction>)> = vec![(Orb::start(), 0, None)];
    let mut depths = vec![0usize];
    let mut seen: HashSet<Orb> = HashSet::from([Orb::start()]);
    let mut queue = VecDeque::from([0usize]);

    while let Some(index) = queue.pop_front() {
        let (orb, _, _) = nodes[index];
        let depth = depths[index];
        if depth >= max_steps {
            continue;
        }
        for direction in Direction::ALL {
            let Ok(next) = orb.moved(direction) else {
                continue;
            };
            if !seen.insert(next) {
                continue;
            }
            nodes.push((next, index, Some(direction)));
            depths.push(depth + 1);
            let child = nodes.len() - 1;

            if next.cell == DOOR {
                if next.weight == target {
                    debug!("Found route after exploring {} states", nodes.len());
                    return Some(unwind(&nodes, child));
                }
                // The door ends the walk either way
                continue;
            }
            queue.push_back(child);
        }
    }
    None
}

fn unwind(nodes: &[(Orb, usize, Option<Direction>)], mut index: usize) -> Route {
    let mut steps = Vec::new();
    while let (_, parent, Some(direction)) = nodes[index] {
        steps.push(direction);
        index = parent;
    }
    steps.reverse();
    Route { steps }
}
